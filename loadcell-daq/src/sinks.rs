//! Consumers of the sample stream.
//!
//! Sinks run on the consumer side, after the session has recorded the
//! sample, so they may read the updated histories.

use std::io::Write;
use std::sync::{Arc, RwLock};

use loadcell_common::Sample;
use tracing::warn;

use crate::error::AcquisitionError;
use crate::session::SessionState;

/// A consumer of samples.
pub trait SampleSink: Send {
    /// A new continuous run is about to start.
    fn on_run_start(&mut self) {}

    /// A sample was produced. For run samples, `session` already holds it.
    fn on_sample(&mut self, sample: &Sample, session: &SessionState);

    /// The run ended; `error` is set if it was aborted.
    fn on_run_end(&mut self, _error: Option<&AcquisitionError>) {}

    /// Whether single-shot reads are forwarded to this sink.
    fn accepts_single_reads(&self) -> bool {
        false
    }
}

/// Output format of the display sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayFormat {
    /// `Time: ... Load: ... Elapsed: ...s`
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Human-readable status lines.
pub struct DisplaySink<W> {
    out: W,
    format: DisplayFormat,
}

impl<W: Write + Send> DisplaySink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            format: DisplayFormat::Text,
        }
    }

    pub fn with_format(mut self, format: DisplayFormat) -> Self {
        self.format = format;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!(error = %e, "Failed to write display line");
        }
    }
}

/// Format a sample as a display line.
pub fn format_sample(sample: &Sample) -> String {
    match sample.elapsed_secs {
        Some(elapsed) => format!(
            "Time: {} Load: {} Elapsed: {:.2}s",
            sample.wall_timestamp, sample.measurement, elapsed
        ),
        None => format!("Time: {} Load: {}", sample.wall_timestamp, sample.measurement),
    }
}

impl<W: Write + Send> SampleSink for DisplaySink<W> {
    fn on_sample(&mut self, sample: &Sample, _session: &SessionState) {
        let line = match self.format {
            DisplayFormat::Text => format_sample(sample),
            DisplayFormat::Json => match sample.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode sample");
                    return;
                }
            },
        };
        self.write_line(&line);
    }

    fn on_run_end(&mut self, error: Option<&AcquisitionError>) {
        if self.format == DisplayFormat::Json {
            return;
        }
        match error {
            None => self.write_line("Run finished"),
            Some(e) => self.write_line(&format!("Run aborted: {}", e)),
        }
    }

    fn accepts_single_reads(&self) -> bool {
        true
    }
}

/// Series shown by the plot: load and friction ratio against elapsed time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlotData {
    pub load: Vec<[f64; 2]>,
    pub ratio: Vec<[f64; 2]>,
    /// Bumped on every update; a renderer redraws when it changes.
    pub revision: u64,
}

/// Read side of a [`PlotSink`], for a renderer on another thread.
#[derive(Debug, Clone)]
pub struct PlotHandle(Arc<RwLock<PlotData>>);

impl PlotHandle {
    /// Copy of the current series.
    pub fn snapshot(&self) -> PlotData {
        match self.0.read() {
            Ok(data) => data.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Maintains plot series from the session histories.
#[derive(Debug, Default)]
pub struct PlotSink {
    data: Arc<RwLock<PlotData>>,
}

impl PlotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> PlotHandle {
        PlotHandle(self.data.clone())
    }

    fn update(&self, f: impl FnOnce(&mut PlotData)) {
        let mut data = match self.data.write() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut data);
        data.revision += 1;
    }
}

impl SampleSink for PlotSink {
    fn on_run_start(&mut self) {
        self.update(|data| {
            data.load.clear();
            data.ratio.clear();
        });
    }

    fn on_sample(&mut self, _sample: &Sample, session: &SessionState) {
        let elapsed = session.elapsed();
        self.update(|data| {
            data.load = elapsed
                .iter()
                .zip(session.measurements())
                .map(|(&t, &m)| [t, f64::from(m)])
                .collect();
            // The ratio series is rebuilt in full: a reference-load change
            // rescales earlier points too.
            data.ratio = elapsed
                .iter()
                .zip(session.ratios())
                .map(|(&t, &r)| [t, r])
                .collect();
        });
    }
}
