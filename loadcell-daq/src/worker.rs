//! Acquisition worker: the poll / decode / emit loop.
//!
//! One worker runs per continuous run, as its own tokio task. It owns the
//! transport for the lifetime of the run and returns it through its join
//! handle, so at most one transaction is ever in flight.
//!
//! Events are delivered on a single ordered channel: zero or more
//! [`WorkerEvent::Sample`]s followed by exactly one terminal event,
//! [`WorkerEvent::Finished`] or [`WorkerEvent::Failed`].
//!
//! Pause and kill are cooperative. Kill is honoured at the top of each
//! iteration and right after the in-flight transaction completes. That
//! transaction's result is discarded even when it failed, and the run ends
//! with [`WorkerEvent::Finished`] without retrying. Kill also cuts the
//! pacing delay and the pause wait short. A transaction is never aborted
//! midway.

use std::sync::Arc;
use std::time::Duration;

use loadcell_common::Sample;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AcquisitionConfig;
use crate::decoder::{DecodeMode, decode_measurement};
use crate::error::{AcquisitionError, ControlError};
use crate::transport::RegisterTransport;

/// Capacity of the worker -> consumer event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Parameters of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub slave_id: u8,
    pub start_address: u16,
    pub register_count: u16,
    pub poll_interval: Duration,
    pub retries: u32,
    pub decode_mode: DecodeMode,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for PollSettings {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            slave_id: config.slave_id,
            start_address: config.start_address,
            register_count: config.register_count,
            poll_interval: config.poll_interval(),
            retries: config.retries,
            decode_mode: config.decode_mode,
        }
    }
}

/// Messages from a worker to its consumer.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A decoded sample.
    Sample(Sample),
    /// The run ended normally (killed, or consumer gone).
    Finished,
    /// The run was aborted by an error.
    Failed(AcquisitionError),
}

impl WorkerEvent {
    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerEvent::Sample(_))
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    Finished,
}

/// Control surface of a running worker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    paused: Arc<watch::Sender<bool>>,
    killed: Arc<watch::Sender<bool>>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerControl {
    /// Suspend sample emission after the current iteration.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Resume sample emission.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Flip the pause flag.
    pub fn toggle_pause(&self) {
        self.paused.send_modify(|paused| *paused = !*paused);
    }

    /// Ask the worker to finish. Idempotent.
    pub fn kill(&self) {
        self.killed.send_replace(true);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_killed(&self) -> bool {
        *self.killed.borrow()
    }

    /// Current lifecycle state as reported by the worker task.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle<T> {
    control: WorkerControl,
    task: JoinHandle<T>,
}

impl<T> WorkerHandle<T> {
    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    /// Whether the task has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to return and take the transport back.
    pub async fn join(self) -> Result<T, ControlError> {
        self.task
            .await
            .map_err(|e| ControlError::WorkerLost(e.to_string()))
    }
}

/// Spawn a worker polling `transport` with `settings`.
///
/// Returns the handle and the receiving end of the event channel.
pub fn spawn<T: RegisterTransport>(
    transport: T,
    settings: PollSettings,
) -> (WorkerHandle<T>, mpsc::Receiver<WorkerEvent>) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (paused_tx, paused_rx) = watch::channel(false);
    let (killed_tx, killed_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(WorkerState::Created);

    let worker = AcquisitionWorker {
        transport,
        settings,
        events: events_tx,
        paused: paused_rx,
        killed: killed_rx,
        state: state_tx,
    };

    let control = WorkerControl {
        paused: Arc::new(paused_tx),
        killed: Arc::new(killed_tx),
        state: state_rx,
    };

    let handle = WorkerHandle {
        control,
        task: tokio::spawn(worker.run()),
    };

    (handle, events_rx)
}

struct AcquisitionWorker<T> {
    transport: T,
    settings: PollSettings,
    events: mpsc::Sender<WorkerEvent>,
    paused: watch::Receiver<bool>,
    killed: watch::Receiver<bool>,
    state: watch::Sender<WorkerState>,
}

impl<T: RegisterTransport> AcquisitionWorker<T> {
    async fn run(mut self) -> T {
        let start = Instant::now();
        self.state.send_replace(WorkerState::Running);

        info!(
            slave_id = self.settings.slave_id,
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Acquisition run started"
        );

        let mut emitted: u64 = 0;
        let outcome = loop {
            if self.is_killed() {
                break Ok(());
            }

            let frame = match self.transact().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let measurement = match decode_measurement(&frame, self.settings.decode_mode) {
                Ok(measurement) => measurement,
                Err(e) => break Err(e.into()),
            };

            let sample = Sample::timed(measurement, start.elapsed().as_secs_f64());
            if self.events.send(WorkerEvent::Sample(sample)).await.is_err() {
                debug!("Event receiver dropped, stopping run");
                break Ok(());
            }
            emitted += 1;

            self.pace().await;
            self.wait_while_paused().await;
        };

        let terminal = match outcome {
            Ok(()) => {
                info!(samples = emitted, "Acquisition run finished");
                WorkerEvent::Finished
            }
            Err(e) => {
                error!(samples = emitted, error = %e, "Acquisition run failed");
                WorkerEvent::Failed(e)
            }
        };

        self.state.send_replace(WorkerState::Finished);
        let _ = self.events.send(terminal).await;
        self.transport
    }

    fn is_killed(&self) -> bool {
        *self.killed.borrow()
    }

    /// One read-holding-registers transaction, retried up to `retries` times.
    ///
    /// Returns `None` once killed: the outcome of a transaction that
    /// completes after kill is discarded, a failure included, and no
    /// further attempt is made.
    async fn transact(&mut self) -> Result<Option<Vec<u16>>, AcquisitionError> {
        let settings = self.settings;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = self
                .transport
                .read_holding_registers(
                    settings.slave_id,
                    settings.start_address,
                    settings.register_count,
                )
                .await;

            if self.is_killed() {
                match result {
                    Ok(_) => debug!("Discarding frame read after kill"),
                    Err(e) => warn!(attempt = attempts, error = %e, "Transaction failed after kill"),
                }
                return Ok(None);
            }

            match result {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) if attempts <= settings.retries => {
                    warn!(attempt = attempts, error = %e, "Transaction failed, retrying");
                }
                Err(e) => {
                    return Err(AcquisitionError::Transport {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }

    async fn pace(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => {}
            _ = wait_for_kill(&mut self.killed) => {}
        }
    }

    async fn wait_while_paused(&mut self) {
        let paused = *self.paused.borrow_and_update();
        if !paused {
            return;
        }

        self.state.send_replace(WorkerState::Paused);
        debug!("Acquisition paused");

        tokio::select! {
            _ = self.paused.wait_for(|paused| !*paused) => {}
            _ = wait_for_kill(&mut self.killed) => {}
        }

        self.state.send_replace(WorkerState::Running);
        debug!("Acquisition resumed");
    }
}

/// Resolves once the kill flag is set. Never resolves if the control
/// side is gone.
async fn wait_for_kill(killed: &mut watch::Receiver<bool>) {
    if killed.wait_for(|killed| *killed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeError;
    use crate::error::TransportError;
    use crate::mock::MockTransport;

    fn settings() -> PollSettings {
        PollSettings::default()
    }

    async fn next_sample(rx: &mut mpsc::Receiver<WorkerEvent>) -> Sample {
        match rx.recv().await {
            Some(WorkerEvent::Sample(sample)) => sample,
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn test_default_settings() {
        let s = settings();
        assert_eq!(s.slave_id, 1);
        assert_eq!(s.start_address, 0);
        assert_eq!(s.register_count, 4);
        assert_eq!(s.poll_interval, Duration::from_millis(200));
        assert_eq!(s.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_samples_at_poll_cadence() {
        let transport = MockTransport::new()
            .then_measurement(10)
            .then_measurement(12)
            .then_measurement(-3)
            .then_repeat(crate::mock::frame_for(0));
        let (handle, mut rx) = spawn(transport, settings());

        let a = next_sample(&mut rx).await;
        let b = next_sample(&mut rx).await;
        let c = next_sample(&mut rx).await;

        assert_eq!((a.measurement, a.elapsed_secs), (10, Some(0.0)));
        assert_eq!((b.measurement, b.elapsed_secs), (12, Some(0.2)));
        assert_eq!((c.measurement, c.elapsed_secs), (-3, Some(0.4)));
        assert_eq!(handle.control().state(), WorkerState::Running);

        handle.control().kill();
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished)));
        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_waits_for_in_flight_transaction() {
        let transport = MockTransport::constant(5).with_latency(Duration::from_millis(100));
        let stats = transport.stats();
        let (handle, mut rx) = spawn(transport, settings());

        // t=100ms: first sample. Second transaction runs 300..400ms.
        next_sample(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.control().kill();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished)));
        assert!(rx.recv().await.is_none(), "nothing after the terminal event");
        assert_eq!(stats.transactions(), 2);

        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_cuts_pacing_delay() {
        let settings = PollSettings {
            poll_interval: Duration::from_secs(60),
            ..settings()
        };
        let (handle, mut rx) = spawn(MockTransport::constant(1), settings);

        next_sample(&mut rx).await;
        let killed_at = Instant::now();
        handle.control().kill();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished)));
        assert!(killed_at.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.control().state(), WorkerState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_toggle_resumes_same_cadence() {
        let (handle, mut rx) = spawn(MockTransport::constant(3), settings());
        let control = handle.control().clone();

        let first = next_sample(&mut rx).await;
        assert_eq!(first.elapsed_secs, Some(0.0));

        control.toggle_pause();
        assert!(control.is_paused());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(rx.try_recv().is_err(), "no samples while paused");
        assert_eq!(control.state(), WorkerState::Paused);

        control.toggle_pause();
        assert!(!control.is_paused());

        let resumed = next_sample(&mut rx).await;
        let next = next_sample(&mut rx).await;
        assert_eq!(resumed.elapsed_secs, Some(1.0));
        assert_eq!(next.elapsed_secs, Some(1.2));
        assert_eq!(control.state(), WorkerState::Running);

        control.kill();
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_while_paused() {
        let (handle, mut rx) = spawn(MockTransport::constant(3), settings());

        next_sample(&mut rx).await;
        handle.control().pause();
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.control().kill();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_terminates_run() {
        let transport = MockTransport::new()
            .then_measurement(1)
            .then_error(TransportError::Timeout(Duration::from_secs(5)));
        let (handle, mut rx) = spawn(transport, settings());

        next_sample(&mut rx).await;
        match rx.recv().await {
            Some(WorkerEvent::Failed(AcquisitionError::Transport { attempts, source })) => {
                assert_eq!(attempts, 1);
                assert!(matches!(source, TransportError::Timeout(_)));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(rx.recv().await.is_none(), "no Finished after Failed");

        let stats = handle.join().await.unwrap().stats();
        assert_eq!(stats.transactions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_recover_transient_failure() {
        let transport = MockTransport::new()
            .then_error(TransportError::Io("noise".to_string()))
            .then_error(TransportError::Io("noise".to_string()))
            .then_measurement(42)
            .then_repeat(crate::mock::frame_for(42));
        let settings = PollSettings {
            retries: 2,
            ..settings()
        };
        let (handle, mut rx) = spawn(transport, settings);

        assert_eq!(next_sample(&mut rx).await.measurement, 42);
        handle.control().kill();
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let transport = MockTransport::new()
            .then_error(TransportError::Io("noise".to_string()))
            .then_error(TransportError::Io("noise".to_string()));
        let settings = PollSettings {
            retries: 1,
            ..settings()
        };
        let (_handle, mut rx) = spawn(transport, settings);

        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::Failed(AcquisitionError::Transport { attempts: 2, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_stops_retrying() {
        let timeout = || TransportError::Timeout(Duration::from_secs(5));
        let transport = MockTransport::new()
            .then_error(timeout())
            .then_error(timeout())
            .then_error(timeout())
            .then_error(timeout())
            .with_latency(Duration::from_millis(100));
        let stats = transport.stats();
        let settings = PollSettings {
            retries: 3,
            ..settings()
        };
        let started = Instant::now();
        let (handle, mut rx) = spawn(transport, settings);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.control().kill();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished)));
        assert!(rx.recv().await.is_none());
        assert_eq!(stats.transactions(), 1, "no retry after kill");
        assert!(started.elapsed() < Duration::from_millis(200));

        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_frame_fails_run() {
        let transport = MockTransport::new().then_frame(vec![1]);
        let (_handle, mut rx) = spawn(transport, settings());

        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::Failed(AcquisitionError::Decode(
                DecodeError::FrameTooShort { len: 1 }
            )))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_ends_task() {
        let (handle, rx) = spawn(MockTransport::constant(1), settings());
        drop(rx);

        let transport = handle.join().await.unwrap();
        assert_eq!(transport.stats().transactions(), 1);
    }

    #[test]
    fn test_terminal_events() {
        assert!(WorkerEvent::Finished.is_terminal());
        assert!(!WorkerEvent::Sample(Sample::single(0)).is_terminal());
    }
}
