use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Signed load value decoded from a register frame.
pub type Measurement = i16;

/// Format used for wall-clock timestamps (local time).
pub const WALL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single load sample produced by one poll iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the run started, rounded to 2 decimals.
    /// `None` for single-shot reads, which are not part of a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,

    /// The decoded load value.
    pub measurement: Measurement,

    /// Local wall-clock time when the sample was taken.
    pub wall_timestamp: String,
}

impl Sample {
    /// Create a sample for a single-shot read, stamped with the current time.
    pub fn single(measurement: Measurement) -> Self {
        Self {
            elapsed_secs: None,
            measurement,
            wall_timestamp: wall_timestamp_now(),
        }
    }

    /// Create a sample belonging to a continuous run.
    ///
    /// The elapsed time is rounded with [`round_elapsed`].
    pub fn timed(measurement: Measurement, elapsed_secs: f64) -> Self {
        Self {
            elapsed_secs: Some(round_elapsed(elapsed_secs)),
            measurement,
            wall_timestamp: wall_timestamp_now(),
        }
    }

    /// Override the wall-clock timestamp.
    pub fn with_wall_timestamp(mut self, wall_timestamp: impl Into<String>) -> Self {
        self.wall_timestamp = wall_timestamp.into();
        self
    }

    /// Serialize this sample as a single JSON line.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Round an elapsed time in seconds to 2 decimal places.
pub fn round_elapsed(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}

/// Current local time formatted with [`WALL_TIMESTAMP_FORMAT`].
pub fn wall_timestamp_now() -> String {
    chrono::Local::now().format(WALL_TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_elapsed() {
        assert_eq!(round_elapsed(0.0), 0.0);
        assert_eq!(round_elapsed(0.204), 0.2);
        assert_eq!(round_elapsed(1.236), 1.24);
        assert_eq!(round_elapsed(12.5), 12.5);
    }

    #[test]
    fn test_single_sample_has_no_elapsed() {
        let sample = Sample::single(42);
        assert_eq!(sample.measurement, 42);
        assert!(sample.elapsed_secs.is_none());
        assert_eq!(sample.wall_timestamp.len(), "2024-01-01 00:00:00".len());
    }

    #[test]
    fn test_timed_sample_rounds() {
        let sample = Sample::timed(-7, 0.41999);
        assert_eq!(sample.elapsed_secs, Some(0.42));
        assert_eq!(sample.measurement, -7);
    }

    #[test]
    fn test_json_line() {
        let sample = Sample::timed(10, 0.2).with_wall_timestamp("2024-05-01 12:00:00");
        let json = sample.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"elapsed_secs":0.2,"measurement":10,"wall_timestamp":"2024-05-01 12:00:00"}"#
        );

        let single = Sample::single(3).with_wall_timestamp("2024-05-01 12:00:00");
        assert!(!single.to_json().unwrap().contains("elapsed_secs"));
    }
}
