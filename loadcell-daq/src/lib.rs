//! Load-cell acquisition engine over Modbus RTU.
//!
//! Polls a load sensor's holding registers, decodes them into signed load
//! values and streams timestamped samples to display, plot and export
//! consumers, with start / continue / pause / stop control of a run.
//!
//! # Components
//!
//! - [`transport`] - The read-holding-registers seam and its RTU implementation
//! - [`decoder`] - Register frame to measurement
//! - [`worker`] - The cancellable poll / decode / emit task
//! - [`session`] - Per-connection histories and the derived friction ratio
//! - [`controller`] - Run control and the consumer-side event pump
//! - [`sinks`] - Display and plot consumers
//! - [`export`] - CSV export of the histories
//!
//! # Example
//!
//! ```ignore
//! use loadcell_daq::{DaqConfig, RunController, sinks::DisplaySink};
//!
//! let config = DaqConfig::load_from_file("loadcell.json5")?;
//! let mut ctl = RunController::connect(&config)
//!     .await?
//!     .with_sink(DisplaySink::new(std::io::stdout()));
//!
//! ctl.continue_run().await?;
//! while let Some(event) = ctl.next_event().await {
//!     // ...
//! }
//! ctl.save()?;
//! ```

pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod export;
pub mod mock;
pub mod session;
pub mod sinks;
pub mod transport;
pub mod worker;

pub use config::DaqConfig;
pub use controller::RunController;
pub use decoder::{DecodeError, DecodeMode, decode_measurement};
pub use error::{AcquisitionError, ConnectionError, ControlError, Result, TransportError};
pub use export::{CsvExporter, ExportError, ExportTable};
pub use session::{ReferenceLoad, ResetPolicy, SessionState};
pub use transport::{RegisterTransport, RtuTransport};
pub use worker::{WorkerControl, WorkerEvent, WorkerState};
