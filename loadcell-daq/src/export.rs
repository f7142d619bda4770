//! Tabular export of a session's histories.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use loadcell_common::Measurement;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::ExportConfig;

/// Column headers, in order.
pub const COLUMNS: [&str; 4] = ["wall_timestamp", "elapsed_s", "load", "friction"];

/// Export errors.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(
        "History length mismatch: {wall_timestamps} timestamps, {elapsed} elapsed, \
         {measurements} loads, {ratios} ratios"
    )]
    LengthMismatch {
        wall_timestamps: usize,
        elapsed: usize,
        measurements: usize,
        ratios: usize,
    },

    #[error("Failed to write export file: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One exported row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub wall_timestamp: String,
    pub elapsed_s: f64,
    pub load: Measurement,
    pub friction: f64,
}

/// Rows zipped from equally long histories.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExportTable {
    rows: Vec<ExportRow>,
}

impl ExportTable {
    /// Zip four parallel columns. Fails unless all have the same length.
    pub fn from_columns(
        wall_timestamps: &[String],
        elapsed: &[f64],
        measurements: &[Measurement],
        ratios: &[f64],
    ) -> Result<Self, ExportError> {
        let len = wall_timestamps.len();
        if elapsed.len() != len || measurements.len() != len || ratios.len() != len {
            return Err(ExportError::LengthMismatch {
                wall_timestamps: len,
                elapsed: elapsed.len(),
                measurements: measurements.len(),
                ratios: ratios.len(),
            });
        }

        let rows = wall_timestamps
            .iter()
            .zip(elapsed)
            .zip(measurements)
            .zip(ratios)
            .map(|(((wall, &elapsed_s), &load), &friction)| ExportRow {
                wall_timestamp: wall.clone(),
                elapsed_s,
                load,
                friction,
            })
            .collect();

        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[ExportRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The friction column.
    pub fn ratios(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.friction).collect()
    }
}

/// Writes export tables as timestamped CSV files.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    directory: PathBuf,
    file_prefix: String,
}

impl CsvExporter {
    pub fn new(directory: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: file_prefix.into(),
        }
    }

    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(&config.directory, &config.file_prefix)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of a file exported now, before collision handling.
    pub fn next_path(&self) -> PathBuf {
        self.path_for(&Self::stamp(), 0)
    }

    fn stamp() -> String {
        chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
    }

    fn path_for(&self, stamp: &str, attempt: u32) -> PathBuf {
        let name = match attempt {
            0 => format!("{}_{}.csv", self.file_prefix, stamp),
            n => format!("{}_{}_{}.csv", self.file_prefix, stamp, n),
        };
        self.directory.join(name)
    }

    /// Create the export file, never replacing an existing one.
    ///
    /// A name already taken within the same second gets a `_1`, `_2`, ...
    /// suffix.
    fn create_file(&self) -> Result<(PathBuf, File), ExportError> {
        let stamp = Self::stamp();
        let mut attempt = 0;
        loop {
            let path = self.path_for(&stamp, attempt);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write `table` to a new file and return its path.
    pub fn write(&self, table: &ExportTable) -> Result<PathBuf, ExportError> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory)?;
        }

        let (path, file) = self.create_file()?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(COLUMNS)?;
        for row in table.rows() {
            writer.serialize(row)?;
        }
        writer.flush()?;

        info!(path = %path.display(), rows = table.len(), "Exported session data");
        Ok(path)
    }
}
