//! Simulated load-cell transport.
//!
//! Replays a script of transaction results, then falls back to a frame
//! generator. Used by tests and by the binary's `--demo` mode.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use loadcell_common::Measurement;

use crate::error::TransportError;
use crate::transport::RegisterTransport;

type FrameGenerator = Box<dyn FnMut(u64) -> Vec<u16> + Send>;

/// Build a 4-register frame whose low word holds `measurement`.
pub fn frame_for(measurement: Measurement) -> Vec<u16> {
    let high = if measurement < 0 { 0xFFFF } else { 0 };
    vec![measurement as u16, high, 0, 0]
}

/// Shared counters observable after the transport has been moved away.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    transactions: Arc<AtomicU64>,
    disconnected: Arc<AtomicBool>,
}

impl MockStats {
    /// Number of completed transactions (successful or failed).
    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

/// In-memory [`RegisterTransport`].
pub struct MockTransport {
    script: VecDeque<Result<Vec<u16>, TransportError>>,
    generator: Option<FrameGenerator>,
    latency: Duration,
    disconnect_error: Option<TransportError>,
    stats: MockStats,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport with an empty script and no generator.
    ///
    /// Every transaction fails once the script is exhausted.
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            generator: None,
            latency: Duration::ZERO,
            disconnect_error: None,
            stats: MockStats::default(),
        }
    }

    /// A transport that always reports `measurement`.
    pub fn constant(measurement: Measurement) -> Self {
        Self::new().then_repeat(frame_for(measurement))
    }

    /// A simulated friction test: the load ramps up, then oscillates
    /// around a plateau.
    pub fn demo() -> Self {
        Self::new()
            .with_generator(|tick| {
                let ramp = (tick.min(25) * 8) as i16;
                let wobble = ((tick % 10) as i16 - 5) * 2;
                frame_for(ramp + wobble)
            })
            .with_latency(Duration::from_millis(20))
    }

    /// Queue a successful response.
    pub fn then_frame(mut self, frame: Vec<u16>) -> Self {
        self.script.push_back(Ok(frame));
        self
    }

    /// Queue a successful response reporting `measurement`.
    pub fn then_measurement(self, measurement: Measurement) -> Self {
        self.then_frame(frame_for(measurement))
    }

    /// Queue a failed transaction.
    pub fn then_error(mut self, error: TransportError) -> Self {
        self.script.push_back(Err(error));
        self
    }

    /// Once the script is exhausted, answer every request with `frame`.
    pub fn then_repeat(self, frame: Vec<u16>) -> Self {
        self.with_generator(move |_| frame.clone())
    }

    /// Once the script is exhausted, build frames from the transaction index.
    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: FnMut(u64) -> Vec<u16> + Send + 'static,
    {
        self.generator = Some(Box::new(generator));
        self
    }

    /// Simulated duration of every transaction.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `disconnect` fail with `error`.
    pub fn with_disconnect_error(mut self, error: TransportError) -> Self {
        self.disconnect_error = Some(error);
        self
    }

    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }
}

impl RegisterTransport for MockTransport {
    async fn read_holding_registers(
        &mut self,
        _slave: u8,
        _address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let tick = self.stats.transactions.fetch_add(1, Ordering::SeqCst);

        let response = match self.script.pop_front() {
            Some(response) => response,
            None => match self.generator.as_mut() {
                Some(generate) => Ok(generate(tick)),
                None => Err(TransportError::Io("mock script exhausted".to_string())),
            },
        };

        response.map(|mut frame| {
            frame.truncate(count as usize);
            frame
        })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(error) = self.disconnect_error.take() {
            return Err(error);
        }
        self.stats.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_for_sign_extends() {
        assert_eq!(frame_for(10), vec![10, 0, 0, 0]);
        assert_eq!(frame_for(-1), vec![0xFFFF, 0xFFFF, 0, 0]);
    }

    #[tokio::test]
    async fn test_script_then_generator() {
        let mut transport = MockTransport::new()
            .then_measurement(1)
            .then_error(TransportError::Io("boom".to_string()))
            .then_repeat(frame_for(7));
        let stats = transport.stats();

        assert_eq!(
            transport.read_holding_registers(1, 0, 4).await.unwrap(),
            vec![1, 0, 0, 0]
        );
        assert!(transport.read_holding_registers(1, 0, 4).await.is_err());
        assert_eq!(
            transport.read_holding_registers(1, 0, 2).await.unwrap(),
            vec![7, 0]
        );
        assert_eq!(stats.transactions(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_script_fails() {
        let mut transport = MockTransport::new();
        assert!(matches!(
            transport.read_holding_registers(1, 0, 4).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_recorded() {
        let mut transport = MockTransport::constant(0);
        let stats = transport.stats();
        assert!(!stats.is_disconnected());
        transport.disconnect().await.unwrap();
        assert!(stats.is_disconnected());
    }
}
