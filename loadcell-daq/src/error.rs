//! Error types for the acquisition engine.

use std::time::Duration;

use thiserror::Error;

use crate::decoder::DecodeError;
use crate::export::ExportError;

/// Result type alias using [`ControlError`].
pub type Result<T> = std::result::Result<T, ControlError>;

/// Failure to open the serial link. Recoverable: the caller may retry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Serial open failed on '{port}': {message}")]
    SerialOpen { port: String, message: String },
}

/// Failure of a single Modbus transaction.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport I/O error: {0}")]
    Io(String),

    #[error("Modbus exception: {0}")]
    Exception(String),
}

/// Error that terminates an acquisition run.
#[derive(Debug, Clone, Error)]
pub enum AcquisitionError {
    #[error("Transaction failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Errors returned by the run controller.
#[derive(Debug, Error)]
pub enum ControlError {
    /// No transport is attached.
    #[error("Not connected")]
    NotConnected,

    /// The operation needs an acquisition run.
    #[error("No acquisition run is active")]
    NoActiveRun,

    /// An acquisition worker still owns the transport.
    #[error("An acquisition run is in progress")]
    RunInProgress,

    /// Reference load must be finite and non-zero.
    #[error("Invalid reference load: {0}")]
    InvalidReferenceLoad(f64),

    /// The worker task panicked or was aborted; the transport is lost.
    #[error("Acquisition worker died: {0}")]
    WorkerLost(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Export(#[from] ExportError),
}
