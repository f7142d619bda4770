//! Run controller: connect / start / continue / stop / save / disconnect.
//!
//! The controller is the consumer side of the engine. It owns the
//! [`SessionState`] and the sinks, and it owns the transport whenever no
//! worker does. Worker events are applied one at a time through
//! [`RunController::next_event`], so the histories only ever have a single
//! writer.

use std::path::PathBuf;

use loadcell_common::Sample;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::DaqConfig;
use crate::decoder::decode_measurement;
use crate::error::{ControlError, Result};
use crate::export::CsvExporter;
use crate::session::{ReferenceLoad, SessionState};
use crate::sinks::SampleSink;
use crate::transport::{RegisterTransport, RtuTransport};
use crate::worker::{self, PollSettings, WorkerControl, WorkerEvent, WorkerHandle};

struct ActiveRun<T> {
    handle: WorkerHandle<T>,
    events: mpsc::Receiver<WorkerEvent>,
    ended: bool,
}

/// Drives acquisition runs over one connection.
pub struct RunController<T: RegisterTransport> {
    transport: Option<T>,
    settings: PollSettings,
    session: SessionState,
    reference_load: ReferenceLoad,
    sinks: Vec<Box<dyn SampleSink>>,
    exporter: CsvExporter,
    active: Option<ActiveRun<T>>,
}

impl RunController<RtuTransport> {
    /// Open the configured serial port.
    ///
    /// A failure is reported and leaves nothing behind; the caller may retry.
    pub async fn connect(config: &DaqConfig) -> Result<Self> {
        let transport = match RtuTransport::open(&config.serial) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(port = %config.serial.port, error = %e, "Connection failed");
                return Err(e.into());
            }
        };
        info!(port = %transport.port(), "Connected");
        Self::with_transport(transport, config)
    }
}

impl<T: RegisterTransport> RunController<T> {
    /// Build a controller around an already open transport.
    pub fn with_transport(transport: T, config: &DaqConfig) -> Result<Self> {
        Ok(Self {
            transport: Some(transport),
            settings: PollSettings::from(&config.acquisition),
            session: SessionState::new(config.session.reset_policy),
            reference_load: ReferenceLoad::new(config.session.reference_load)?,
            sinks: Vec::new(),
            exporter: CsvExporter::from_config(&config.export),
            active: None,
        })
    }

    /// Register a consumer of the sample stream.
    pub fn add_sink(&mut self, sink: impl SampleSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn with_sink(mut self, sink: impl SampleSink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Shared handle to the reference load; may be updated from anywhere.
    pub fn reference_load(&self) -> ReferenceLoad {
        self.reference_load.clone()
    }

    pub fn set_reference_load(&self, value: f64) -> Result<()> {
        self.reference_load.set(value)
    }

    /// Whether a transport is attached (possibly lent to a worker).
    pub fn is_connected(&self) -> bool {
        self.transport.is_some() || self.active.is_some()
    }

    /// Whether a worker exists whose terminal event has not been consumed.
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|run| !run.ended)
    }

    /// Control handle of the active worker.
    pub fn control(&self) -> Option<&WorkerControl> {
        self.active.as_ref().map(|run| run.handle.control())
    }

    /// Single-shot read, forwarded to sinks accepting single reads.
    ///
    /// Does not touch the session histories.
    pub async fn read_once(&mut self) -> Result<Sample> {
        self.reclaim_ended().await?;
        if self.active.is_some() {
            return Err(ControlError::RunInProgress);
        }

        let settings = self.settings;
        let transport = self.transport.as_mut().ok_or(ControlError::NotConnected)?;
        let frame = transport
            .read_holding_registers(
                settings.slave_id,
                settings.start_address,
                settings.register_count,
            )
            .await?;
        let sample = Sample::single(decode_measurement(&frame, settings.decode_mode)?);

        for sink in self.sinks.iter_mut().filter(|s| s.accepts_single_reads()) {
            sink.on_sample(&sample, &self.session);
        }
        Ok(sample)
    }

    /// Start a continuous run.
    ///
    /// A run that was stopped but has not finished yet is drained first.
    /// A live run is an error.
    pub async fn continue_run(&mut self) -> Result<()> {
        if let Some(run) = &self.active {
            if !run.ended && !run.handle.control().is_killed() {
                return Err(ControlError::RunInProgress);
            }
        }
        self.wait_finished().await?;

        let transport = self.transport.take().ok_or(ControlError::NotConnected)?;
        self.session.begin_run();
        for sink in &mut self.sinks {
            sink.on_run_start();
        }

        let (handle, events) = worker::spawn(transport, self.settings);
        self.active = Some(ActiveRun {
            handle,
            events,
            ended: false,
        });

        info!(run = self.session.runs(), "Continuous run started");
        Ok(())
    }

    /// Ask the active worker to finish. History is kept for export.
    ///
    /// Returns `false` if there was nothing to stop.
    pub fn stop(&self) -> bool {
        match &self.active {
            Some(run) if !run.ended => {
                run.handle.control().kill();
                info!("Stop requested");
                true
            }
            _ => false,
        }
    }

    /// Flip the pause flag of the active worker; returns the new state.
    pub fn toggle_pause(&self) -> Result<bool> {
        let control = self.control().ok_or(ControlError::NoActiveRun)?;
        control.toggle_pause();
        Ok(control.is_paused())
    }

    /// Wait for the next worker event and apply it to the session and sinks.
    ///
    /// Returns `None` when no run is active or its terminal event was
    /// already consumed.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        let event = {
            let run = self.active.as_mut()?;
            if run.ended {
                return None;
            }
            match run.events.recv().await {
                Some(event) => {
                    run.ended = event.is_terminal();
                    event
                }
                None => {
                    run.ended = true;
                    warn!("Worker channel closed without a terminal event");
                    return None;
                }
            }
        };

        self.apply(&event);
        Some(event)
    }

    fn apply(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Sample(sample) => {
                self.session.record(sample, self.reference_load.get());
                for sink in &mut self.sinks {
                    sink.on_sample(sample, &self.session);
                }
            }
            WorkerEvent::Finished => {
                info!(samples = self.session.measurements().len(), "Run complete");
                for sink in &mut self.sinks {
                    sink.on_run_end(None);
                }
            }
            WorkerEvent::Failed(e) => {
                warn!(error = %e, "Run aborted");
                for sink in &mut self.sinks {
                    sink.on_run_end(Some(e));
                }
            }
        }
    }

    /// Consume events until the active run ends, then take the transport back.
    ///
    /// Does not stop the run; call [`stop`](Self::stop) first to end it.
    pub async fn wait_finished(&mut self) -> Result<()> {
        while self.is_running() {
            self.next_event().await;
        }
        self.reclaim_ended().await
    }

    async fn reclaim_ended(&mut self) -> Result<()> {
        if self.active.as_ref().is_some_and(|run| run.ended) {
            if let Some(run) = self.active.take() {
                self.transport = Some(run.handle.join().await?);
            }
        }
        Ok(())
    }

    /// Export the session histories. Allowed during and after a run.
    pub fn save(&self) -> Result<PathBuf> {
        let table = self.session.export_table()?;
        Ok(self.exporter.write(&table)?)
    }

    /// Close the connection and discard the session.
    ///
    /// Refused while a worker is active. The transport and the session are
    /// released even when closing the link reports an error.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.reclaim_ended().await?;
        if self.active.is_some() {
            return Err(ControlError::RunInProgress);
        }

        let mut transport = self.transport.take().ok_or(ControlError::NotConnected)?;
        let closed = transport.disconnect().await;
        drop(transport);
        self.session = SessionState::new(self.session.reset_policy());

        match closed {
            Ok(()) => {
                info!("Connection closed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Connection closed with error");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AcquisitionError, TransportError};
    use crate::mock::{MockTransport, frame_for};
    use crate::sinks::PlotSink;
    use std::time::Duration;

    fn config() -> DaqConfig {
        DaqConfig::for_port("mock")
    }

    async fn collect_samples(ctl: &mut RunController<MockTransport>, n: usize) {
        for _ in 0..n {
            match ctl.next_event().await {
                Some(WorkerEvent::Sample(_)) => {}
                other => panic!("expected sample, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_read_once_leaves_history_untouched() {
        let transport = MockTransport::new().then_measurement(-12);
        let mut ctl = RunController::with_transport(transport, &config()).unwrap();

        let sample = ctl.read_once().await.unwrap();
        assert_eq!(sample.measurement, -12);
        assert!(sample.elapsed_secs.is_none());
        assert!(ctl.session().wall_timestamps().is_empty());
        assert!(ctl.session().measurements().is_empty());
    }

    #[tokio::test]
    async fn test_read_once_short_frame() {
        let transport = MockTransport::new().then_frame(vec![1]);
        let mut ctl = RunController::with_transport(transport, &config()).unwrap();

        assert!(matches!(
            ctl.read_once().await,
            Err(ControlError::Decode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stop_keeps_history() {
        let mut ctl =
            RunController::with_transport(MockTransport::constant(10), &config()).unwrap();

        ctl.continue_run().await.unwrap();
        assert!(ctl.is_running());
        collect_samples(&mut ctl, 3).await;

        assert!(ctl.stop());
        ctl.wait_finished().await.unwrap();

        assert!(!ctl.is_running());
        assert!(ctl.is_connected());
        assert_eq!(ctl.session().measurements(), &[10, 10, 10]);
        assert_eq!(ctl.session().elapsed(), &[0.0, 0.2, 0.4]);
        assert!(!ctl.stop(), "nothing left to stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_run_blocks_other_operations() {
        let mut ctl =
            RunController::with_transport(MockTransport::constant(1), &config()).unwrap();
        ctl.continue_run().await.unwrap();

        assert!(matches!(
            ctl.continue_run().await,
            Err(ControlError::RunInProgress)
        ));
        assert!(matches!(ctl.read_once().await, Err(ControlError::RunInProgress)));
        assert!(matches!(ctl.disconnect().await, Err(ControlError::RunInProgress)));

        ctl.stop();
        ctl.wait_finished().await.unwrap();
        ctl.disconnect().await.unwrap();
        assert!(!ctl.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_resets_all_but_wall_timestamps() {
        let mut ctl =
            RunController::with_transport(MockTransport::constant(7), &config()).unwrap();

        ctl.continue_run().await.unwrap();
        collect_samples(&mut ctl, 3).await;
        ctl.stop();

        // Restarting drains the stopped run before resetting.
        ctl.continue_run().await.unwrap();
        assert_eq!(ctl.session().runs(), 2);
        assert_eq!(ctl.session().elapsed().len(), 0);
        assert_eq!(ctl.session().measurements().len(), 0);
        assert_eq!(ctl.session().wall_timestamps().len(), 3);

        collect_samples(&mut ctl, 1).await;
        assert_eq!(ctl.session().wall_timestamps().len(), 4);
        assert_eq!(ctl.session().elapsed(), &[0.0]);
        assert!(matches!(ctl.save(), Err(ControlError::Export(_))));

        ctl.stop();
        ctl.wait_finished().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_ends_run_and_returns_transport() {
        let transport = MockTransport::new()
            .then_measurement(3)
            .then_error(TransportError::Timeout(Duration::from_secs(5)))
            .then_repeat(frame_for(4));
        let mut ctl = RunController::with_transport(transport, &config()).unwrap();

        ctl.continue_run().await.unwrap();
        collect_samples(&mut ctl, 1).await;
        assert!(matches!(ctl.next_event().await, Some(WorkerEvent::Failed(_))));
        assert!(ctl.next_event().await.is_none());
        assert!(!ctl.is_running());

        // The connection survives; a single read works again.
        assert_eq!(ctl.read_once().await.unwrap().measurement, 4);
        assert_eq!(ctl.session().measurements(), &[3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reference_load_update_rescales() {
        let transport = MockTransport::new()
            .then_measurement(10)
            .then_measurement(20)
            .then_repeat(frame_for(30));
        let mut ctl = RunController::with_transport(transport, &config())
            .unwrap()
            .with_sink(PlotSink::new());
        ctl.set_reference_load(10.0).unwrap();

        ctl.continue_run().await.unwrap();
        collect_samples(&mut ctl, 2).await;
        assert_eq!(ctl.session().ratios(), &[1.0, 2.0]);

        ctl.reference_load().set(20.0).unwrap();
        collect_samples(&mut ctl, 1).await;
        assert_eq!(ctl.session().ratios(), &[0.5, 1.0, 1.5]);

        assert!(ctl.set_reference_load(0.0).is_err());
        ctl.stop();
        ctl.wait_finished().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_pause() {
        let mut ctl =
            RunController::with_transport(MockTransport::constant(1), &config()).unwrap();
        assert!(matches!(ctl.toggle_pause(), Err(ControlError::NoActiveRun)));

        ctl.continue_run().await.unwrap();
        assert!(ctl.toggle_pause().unwrap());
        assert!(!ctl.toggle_pause().unwrap());

        ctl.stop();
        ctl.wait_finished().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_disconnect_still_releases() {
        let transport = MockTransport::constant(4)
            .with_disconnect_error(TransportError::Io("port vanished".to_string()));
        let mut ctl = RunController::with_transport(transport, &config()).unwrap();

        ctl.continue_run().await.unwrap();
        collect_samples(&mut ctl, 2).await;
        ctl.stop();
        ctl.wait_finished().await.unwrap();
        assert_eq!(ctl.session().measurements().len(), 2);

        assert!(matches!(
            ctl.disconnect().await,
            Err(ControlError::Transport(TransportError::Io(_)))
        ));
        assert!(!ctl.is_connected());
        assert!(ctl.session().measurements().is_empty());
        assert!(ctl.session().wall_timestamps().is_empty());
        assert_eq!(ctl.session().runs(), 0);
        assert!(matches!(ctl.disconnect().await, Err(ControlError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_keeps_history() {
        let transport = MockTransport::new().then_measurement(3).then_frame(vec![1]);
        let mut ctl = RunController::with_transport(transport, &config()).unwrap();

        ctl.continue_run().await.unwrap();
        collect_samples(&mut ctl, 1).await;
        assert!(matches!(
            ctl.next_event().await,
            Some(WorkerEvent::Failed(AcquisitionError::Decode(_)))
        ));
        ctl.wait_finished().await.unwrap();

        assert_eq!(ctl.session().measurements(), &[3]);
        assert_eq!(ctl.session().elapsed().len(), 1);
        assert_eq!(ctl.session().wall_timestamps().len(), 1);
        assert_eq!(ctl.session().ratios().len(), 1);
        assert!(ctl.is_connected());
        assert_eq!(ctl.session().export_table().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_discards_session() {
        let transport = MockTransport::constant(1);
        let stats = transport.stats();
        let mut ctl = RunController::with_transport(transport, &config()).unwrap();

        ctl.disconnect().await.unwrap();
        assert!(stats.is_disconnected());
        assert!(matches!(ctl.read_once().await, Err(ControlError::NotConnected)));
        assert!(matches!(
            ctl.continue_run().await,
            Err(ControlError::NotConnected)
        ));
    }
}
