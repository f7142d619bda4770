//! Per-connection sample histories.
//!
//! A [`SessionState`] lives from connect to disconnect. Each continuous run
//! appends to it; restarting a run resets the elapsed-time and load
//! histories but, under the default [`ResetPolicy`], keeps the wall-clock
//! history. Exports taken after a restart therefore see columns of unequal
//! length and are refused.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use loadcell_common::{Measurement, Sample};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ControlError;
use crate::export::{ExportError, ExportTable};

/// Which histories a restarted run clears.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Clear elapsed-time, load and ratio histories; keep wall timestamps.
    #[default]
    RetainWallTimestamps,
    /// Clear every history.
    ClearAll,
}

/// Externally supplied reference load, shared between threads.
///
/// The session reads it on every update, so a change applies to the whole
/// ratio series, including points already recorded.
#[derive(Debug, Clone)]
pub struct ReferenceLoad(Arc<AtomicU64>);

impl ReferenceLoad {
    pub fn new(value: f64) -> Result<Self, ControlError> {
        check_reference_load(value)?;
        Ok(Self(Arc::new(AtomicU64::new(value.to_bits()))))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Replace the value. Zero and non-finite values are rejected.
    pub fn set(&self, value: f64) -> Result<(), ControlError> {
        check_reference_load(value)?;
        self.0.store(value.to_bits(), Ordering::Release);
        Ok(())
    }
}

fn check_reference_load(value: f64) -> Result<(), ControlError> {
    if value.is_finite() && value != 0.0 {
        Ok(())
    } else {
        Err(ControlError::InvalidReferenceLoad(value))
    }
}

/// Accumulated histories of the current connection.
#[derive(Debug, Default)]
pub struct SessionState {
    reset_policy: ResetPolicy,
    wall_timestamps: Vec<String>,
    elapsed: Vec<f64>,
    measurements: Vec<Measurement>,
    ratios: Vec<f64>,
    runs: u32,
}

impl SessionState {
    pub fn new(reset_policy: ResetPolicy) -> Self {
        Self {
            reset_policy,
            ..Self::default()
        }
    }

    /// Prepare the histories for a new continuous run.
    ///
    /// The first run of a connection starts from the empty state; later
    /// runs clear according to the reset policy.
    pub fn begin_run(&mut self) {
        if self.runs > 0 {
            self.elapsed.clear();
            self.measurements.clear();
            self.ratios.clear();
            if self.reset_policy == ResetPolicy::ClearAll {
                self.wall_timestamps.clear();
            }
        }
        self.runs += 1;
        debug!(
            run = self.runs,
            retained_timestamps = self.wall_timestamps.len(),
            "Session prepared for run"
        );
    }

    /// Append a run sample and recompute the ratio series with `reference_load`.
    ///
    /// Samples without an elapsed time are not part of a run and leave the
    /// histories untouched.
    pub fn record(&mut self, sample: &Sample, reference_load: f64) -> bool {
        let Some(elapsed) = sample.elapsed_secs else {
            return false;
        };

        self.wall_timestamps.push(sample.wall_timestamp.clone());
        self.elapsed.push(elapsed);
        self.measurements.push(sample.measurement);
        self.recompute_ratios(reference_load);
        true
    }

    /// Rebuild the whole ratio series from the load history.
    pub fn recompute_ratios(&mut self, reference_load: f64) {
        self.ratios.clear();
        self.ratios.extend(
            self.measurements
                .iter()
                .map(|&m| f64::from(m) / reference_load),
        );
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }

    /// Number of continuous runs started on this connection.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn wall_timestamps(&self) -> &[String] {
        &self.wall_timestamps
    }

    pub fn elapsed(&self) -> &[f64] {
        &self.elapsed
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn ratios(&self) -> &[f64] {
        &self.ratios
    }

    /// Zip the four histories into an export table.
    pub fn export_table(&self) -> Result<ExportTable, ExportError> {
        ExportTable::from_columns(
            &self.wall_timestamps,
            &self.elapsed,
            &self.measurements,
            &self.ratios,
        )
    }
}
