//! Modbus RTU transport.
//!
//! [`RegisterTransport`] is the seam between the acquisition engine and the
//! wire: one "read holding registers" transaction at a time. [`RtuTransport`]
//! implements it over a serial port.

use std::future::Future;
use std::time::Duration;

use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::error::{ConnectionError, TransportError};

/// A request/response executor for holding-register reads.
///
/// Implementations must not be shared between concurrent callers; the
/// engine hands the transport to exactly one owner at a time.
pub trait RegisterTransport: Send + 'static {
    /// Read `count` holding registers starting at `address` from `slave`.
    fn read_holding_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    /// Release the underlying connection.
    fn disconnect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Modbus RTU master over a serial port.
pub struct RtuTransport {
    ctx: Context,
    port: String,
    timeout: Duration,
}

impl RtuTransport {
    /// Open the serial port described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self, ConnectionError> {
        let parity = match config.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);

        let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ConnectionError::SerialOpen {
                port: config.port.clone(),
                message: e.to_string(),
            }
        })?;

        info!(
            port = %config.port,
            baud_rate = config.baud_rate,
            timeout_ms = config.timeout_ms,
            "Serial link opened"
        );

        Ok(Self {
            ctx: rtu::attach(serial),
            port: config.port.clone(),
            timeout: config.timeout(),
        })
    }

    /// The serial port path.
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl RegisterTransport for RtuTransport {
    async fn read_holding_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let timeout = self.timeout;
        self.ctx.set_slave(Slave(slave));

        let registers = tokio::time::timeout(timeout, self.ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))?;

        debug!(slave, address, count, registers = ?registers, "Read holding registers");
        Ok(registers)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        info!(port = %self.port, "Serial link closed");
        Ok(())
    }
}
