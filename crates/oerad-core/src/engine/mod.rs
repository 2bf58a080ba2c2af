//! Asynchronous transfer engine.
//!
//! One inbound transfer is kept armed at all times while streaming: when it
//! completes, the spare buffer is submitted before the handler sees the data,
//! so the device never waits for the host. Outbound commands go out one at a
//! time; under [`PendingPolicy::Queue`] further commands wait behind the
//! in-flight one and are submitted from the pump thread.
//!
//! All completion handlers run on whichever thread pumps events, either
//! [`Radar::run`] or [`Radar::run_single`].

pub mod handler;
pub(crate) mod slot;

use tracing::{debug, error, info, instrument, warn};

use crate::config::PendingPolicy;
use crate::device::{Radar, lock};
use crate::error::{RadarError, Result};
use crate::events::{CommandPath, RadarEvent};
use crate::protocol::{
    COMMAND_LENGTH, Command, Gain, MIN_BUFFER_IN_SIZE, SINGLE_PUMP_ITERATIONS, TimeWindow,
};
use crate::state::{DeviceState, Operation};
use crate::transport::{Completion, CompletionStatus, Direction, TransportError, UsbTransport};

pub use handler::TransferHandler;

use slot::OutboundSlot;

impl Radar {
    /// Arm the inbound direction with a handler and transfer length.
    pub fn init_transfer_in(&self, handler: impl TransferHandler + 'static, len: usize) {
        if len < MIN_BUFFER_IN_SIZE {
            warn!(len, min = MIN_BUFFER_IN_SIZE, "Inbound buffer shorter than recommended");
        }
        let mut slot = lock(&self.inbound);
        slot.handler = Some(Box::new(handler));
        slot.len = len;
    }

    /// Arm the outbound direction with a completion handler and buffer
    /// capacity.
    pub fn init_transfer_out(&self, handler: impl TransferHandler + 'static, capacity: usize) {
        let mut slot = lock(&self.outbound);
        slot.handler = Some(Box::new(handler));
        slot.capacity = capacity;
    }

    /// [`init_transfer_in`](Self::init_transfer_in) once the bridge is
    /// configured.
    pub fn set_async_in_params(
        &self,
        handler: impl TransferHandler + 'static,
        len: usize,
    ) -> Result<()> {
        self.require(Operation::ArmTransfer)?;
        self.init_transfer_in(handler, len);
        Ok(())
    }

    /// [`init_transfer_out`](Self::init_transfer_out) once the bridge is
    /// configured.
    pub fn set_async_out_params(
        &self,
        handler: impl TransferHandler + 'static,
        capacity: usize,
    ) -> Result<()> {
        self.require(Operation::ArmTransfer)?;
        self.init_transfer_out(handler, capacity);
        Ok(())
    }

    /// Submit the armed inbound transfer.
    ///
    /// With an inbound transfer already pending, `Queue` keeps using it and
    /// `Reject` fails with `TransferPending`.
    #[instrument(skip(self))]
    pub fn register_transfer_in(&self) -> Result<()> {
        self.require(Operation::RegisterTransferIn)?;
        let transport = self.transport()?;

        let mut slot = lock(&self.inbound);
        if !slot.is_armed() {
            return Err(RadarError::ConfigurationEmpty("inbound buffer"));
        }
        if slot.pending.is_some() {
            return match self.config.pending_policy {
                PendingPolicy::Queue => {
                    debug!("Reusing pending IN transfer");
                    Ok(())
                }
                PendingPolicy::Reject => Err(RadarError::TransferPending {
                    direction: Direction::In,
                }),
            };
        }

        let buffer = slot.next_buffer();
        let token = transport.submit(Direction::In, buffer).map_err(|e| {
            error!(error = %e, "Could not submit IN transfer");
            e
        })?;
        debug!(%token, len = slot.len, "Submitted IN transfer");
        slot.pending = Some(token);
        Ok(())
    }

    /// Submit one command on the armed outbound direction.
    pub fn register_transfer_out(&self, command: Command) -> Result<()> {
        self.issue_async(&[command])
    }

    /// Record and submit a time window.
    pub fn set_time_window_async(&self, window: TimeWindow) -> Result<()> {
        self.require(Operation::IssueAsyncCommand)?;
        self.require_outbound_armed()?;
        self.update_settings(|s| s.time_window = Some(window));
        self.issue_async(&[window.into()])
    }

    /// Record and submit a gain level.
    pub fn set_gain_async(&self, gain: Gain) -> Result<()> {
        self.require(Operation::IssueAsyncCommand)?;
        self.require_outbound_armed()?;
        self.update_settings(|s| s.gain = Some(gain));
        self.issue_async(&[gain.into()])
    }

    /// Submit time window then gain and enter `Transmitting`.
    ///
    /// The pair is accepted or refused as a whole.
    #[instrument(skip(self))]
    pub fn start_transmission_async(&self, window: TimeWindow, gain: Gain) -> Result<()> {
        self.require(Operation::StartTransmission)?;
        self.issue_start_pair(window, gain)?;

        info!(window = %window, gain = %gain, "Transmission started");
        self.advance_to(DeviceState::Transmitting);
        Ok(())
    }

    /// Arm both directions, start transmission and submit the first
    /// inbound transfer. The radar enters `Transmitting` only once the
    /// inbound transfer is in flight.
    #[instrument(skip(self, in_handler, out_handler))]
    pub fn start_io_async(
        &self,
        window: TimeWindow,
        gain: Gain,
        in_handler: impl TransferHandler + 'static,
        in_len: usize,
        out_handler: impl TransferHandler + 'static,
        out_capacity: usize,
    ) -> Result<()> {
        self.require(Operation::StartTransmission)?;
        self.init_transfer_out(out_handler, out_capacity);
        self.init_transfer_in(in_handler, in_len);
        self.issue_start_pair(window, gain)?;
        self.register_transfer_in()?;

        info!(window = %window, gain = %gain, "Transmission started");
        self.advance_to(DeviceState::Transmitting);
        Ok(())
    }

    /// Pump events until [`stop`](Self::stop) or
    /// [`disconnect`](Self::disconnect) is called from another thread.
    ///
    /// A pump failure ends the loop, drops the radar back to `Transmitting`
    /// and is returned.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<()> {
        self.require(Operation::RunLoop)?;
        let transport = self.transport()?;
        self.goto_state(DeviceState::Running);
        info!("Event loop started");

        while self.state() == DeviceState::Running {
            match transport.handle_events(self.config.pump_timeout()) {
                Ok(completions) => self.dispatch(transport.as_ref(), completions),
                // Released by `disconnect` on another thread.
                Err(TransportError::Disconnected) => {
                    debug!("Transport released, leaving event loop");
                    break;
                }
                Err(_) if self.state() != DeviceState::Running => break,
                Err(e) => {
                    error!(error = %e, "Error handling USB events");
                    self.transition(DeviceState::Running, DeviceState::Transmitting);
                    return Err(e.into());
                }
            }
        }

        info!(state = %self.state(), "Event loop stopped");
        Ok(())
    }

    /// End a running event loop. A no-op in any other state.
    pub fn stop(&self) {
        if self.transition(DeviceState::Running, DeviceState::Transmitting) {
            debug!("Stop requested");
        }
    }

    /// Pump events a fixed number of times on the calling thread.
    ///
    /// Pump failures are logged, not returned.
    pub fn run_single(&self) -> Result<()> {
        let transport = self.transport()?;
        for iteration in 0..SINGLE_PUMP_ITERATIONS {
            match transport.handle_events(self.config.pump_timeout()) {
                Ok(completions) => self.dispatch(transport.as_ref(), completions),
                Err(e) => error!(iteration, error = %e, "Error handling USB events"),
            }
        }
        Ok(())
    }

    /// Capture a trace into `handler` by arming a fresh inbound transfer of
    /// `len` bytes and pumping events on this thread.
    pub fn get_current_trace_async_with(
        &self,
        handler: impl TransferHandler + 'static,
        len: usize,
    ) -> Result<()> {
        self.require(Operation::CaptureTrace)?;
        self.init_transfer_in(handler, len);
        self.register_transfer_in()?;
        self.run_single()
    }

    /// Capture a trace with the inbound handler already armed.
    pub fn get_current_trace_async(&self) -> Result<()> {
        self.require(Operation::CaptureTrace)?;
        self.register_transfer_in()?;
        self.run_single()
    }

    /// Record time window and gain and submit them as one batch.
    fn issue_start_pair(&self, window: TimeWindow, gain: Gain) -> Result<()> {
        self.require_outbound_armed()?;
        self.update_settings(|s| {
            s.time_window = Some(window);
            s.gain = Some(gain);
        });
        self.issue_async(&[window.into(), gain.into()])
    }

    fn require_outbound_armed(&self) -> Result<()> {
        if lock(&self.outbound).is_armed() {
            Ok(())
        } else {
            Err(RadarError::ConfigurationEmpty("outbound buffer"))
        }
    }

    /// Submit `commands` in order, holding back those that cannot go out
    /// yet according to the pending policy.
    fn issue_async(&self, commands: &[Command]) -> Result<()> {
        self.require(Operation::IssueAsyncCommand)?;
        let transport = self.transport()?;

        let mut slot = lock(&self.outbound);
        if !slot.is_armed() {
            return Err(RadarError::ConfigurationEmpty("outbound buffer"));
        }

        let (now, held) = match commands.split_first() {
            Some((first, rest)) if !slot.is_busy() => (Some(*first), rest),
            _ => (None, commands),
        };

        match self.config.pending_policy {
            PendingPolicy::Reject if now.is_none() => {
                return Err(RadarError::TransferPending {
                    direction: Direction::Out,
                });
            }
            PendingPolicy::Reject => {}
            PendingPolicy::Queue => {
                let depth = self.config.outbound_queue_depth;
                if slot.queue.len() + held.len() > depth {
                    warn!(depth, "Outbound queue full");
                    return Err(RadarError::QueueFull { depth });
                }
            }
        }

        if let Some(command) = now {
            self.submit_outbound(transport.as_ref(), &mut slot, command)?;
        }
        for command in held {
            debug!(%command, "Queued command");
            slot.queue.push_back(*command);
        }
        drop(slot);

        if let Some(command) = now {
            self.emit_async_command(command);
        }
        Ok(())
    }

    fn emit_async_command(&self, command: Command) {
        self.emit(RadarEvent::CommandIssued {
            command,
            path: CommandPath::Async,
        });
    }

    fn submit_outbound(
        &self,
        transport: &dyn UsbTransport,
        slot: &mut OutboundSlot,
        command: Command,
    ) -> Result<()> {
        let buffer = vec![command.code(); COMMAND_LENGTH];
        let token = transport.submit(Direction::Out, buffer).map_err(|e| {
            error!(%command, error = %e, "Could not submit OUT transfer");
            e
        })?;
        debug!(%token, %command, "Submitted OUT transfer");
        slot.pending = Some((token, command));
        Ok(())
    }

    fn dispatch(&self, transport: &dyn UsbTransport, completions: Vec<Completion>) {
        for completion in completions {
            match completion.direction {
                Direction::In => self.complete_inbound(transport, completion),
                Direction::Out => self.complete_outbound(transport, completion),
            }
        }
    }

    fn complete_inbound(&self, transport: &dyn UsbTransport, completion: Completion) {
        let handler = {
            let mut slot = lock(&self.inbound);
            if slot.pending != Some(completion.token) {
                debug!(token = %completion.token, "Ignoring stale IN completion");
                return;
            }
            slot.pending = None;
            if completion.status == CompletionStatus::Cancelled {
                debug!(token = %completion.token, "IN transfer cancelled");
                return;
            }

            if slot.len > 0 {
                let buffer = slot.next_buffer();
                match transport.submit(Direction::In, buffer) {
                    Ok(token) => slot.pending = Some(token),
                    Err(e) => error!(error = %e, "Could not re-arm IN transfer"),
                }
            }
            slot.handler.take()
        };

        if let CompletionStatus::Failed(message) = &completion.status {
            warn!(token = %completion.token, "IN transfer failed: {}", message);
            self.emit(RadarEvent::TransferFailed {
                direction: Direction::In,
                message: message.clone(),
            });
        }

        let data = completion.data();
        self.emit(RadarEvent::TraceReceived { length: data.len() });
        let returned = handler.map(|mut h| {
            h.on_complete(data);
            h
        });

        let mut slot = lock(&self.inbound);
        if slot.handler.is_none() {
            slot.handler = returned;
        }
        if slot.spare.is_none() {
            slot.spare = Some(completion.buffer);
        }
    }

    fn complete_outbound(&self, transport: &dyn UsbTransport, completion: Completion) {
        let mut resubmitted = None;
        let handler = {
            let mut slot = lock(&self.outbound);
            match slot.pending {
                Some((token, _)) if token == completion.token => slot.pending = None,
                _ => {
                    debug!(token = %completion.token, "Ignoring stale OUT completion");
                    return;
                }
            }
            if completion.status == CompletionStatus::Cancelled {
                debug!(token = %completion.token, "OUT transfer cancelled");
                slot.queue.clear();
                return;
            }

            if let Some(next) = slot.queue.pop_front() {
                match self.submit_outbound(transport, &mut slot, next) {
                    Ok(()) => resubmitted = Some(next),
                    Err(e) => {
                        error!(error = %e, dropped = slot.queue.len(), "Dropping queued commands");
                        slot.queue.clear();
                    }
                }
            }
            slot.handler.take()
        };

        if let Some(command) = resubmitted {
            self.emit_async_command(command);
        }

        if let CompletionStatus::Failed(message) = &completion.status {
            warn!(token = %completion.token, "OUT transfer failed: {}", message);
            self.emit(RadarEvent::TransferFailed {
                direction: Direction::Out,
                message: message.clone(),
            });
        }

        if let Some(mut h) = handler {
            h.on_complete(completion.data());
            let mut slot = lock(&self.outbound);
            if slot.handler.is_none() {
                slot.handler = Some(h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, OnceLock, Weak};

    use super::*;
    use crate::config::RadarConfig;
    use crate::events::{NullObserver, RadarObserver};
    use crate::protocol::constants::{OERAD_DEFAULT_PID, OERAD_VENDOR_ID};
    use crate::transport::{DeviceCandidate, MockBus, MockTransport, TransportError, UsbBus};

    fn radar_with(config: RadarConfig) -> (Arc<MockTransport>, Radar) {
        let bus = Arc::new(MockBus::new());
        let mock = bus.transport();
        let candidate = DeviceCandidate {
            vendor_id: OERAD_VENDOR_ID,
            product_id: OERAD_DEFAULT_PID,
            address: 1,
        };
        let bus: Arc<dyn UsbBus> = bus;
        let radar =
            Radar::new(candidate, bus, config).with_observer(Arc::new(NullObserver));
        radar.connect().unwrap();
        radar.initialize().unwrap();
        (mock, radar)
    }

    fn initialized() -> (Arc<MockTransport>, Radar) {
        radar_with(RadarConfig::default())
    }

    fn sent_out(mock: &MockTransport) -> Vec<u8> {
        mock.submissions()
            .into_iter()
            .filter(|(d, _)| *d == Direction::Out)
            .map(|(_, b)| b[0])
            .collect()
    }

    #[test]
    fn test_async_command_needs_outbound_arm() {
        let (mock, radar) = initialized();
        assert!(matches!(
            radar.set_gain_async(Gain::Level1),
            Err(RadarError::ConfigurationEmpty(_))
        ));
        assert!(mock.submissions().is_empty());
        assert_eq!(radar.settings().gain, None);
    }

    #[test]
    fn test_out_buffer_is_single_byte_snapshot() {
        let (mock, radar) = initialized();
        radar.init_transfer_out(|_: &[u8]| {}, 64);
        radar.set_time_window_async(TimeWindow::Long).unwrap();
        let subs = mock.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0], (Direction::Out, vec![0x37]));
    }

    #[test]
    fn test_queue_policy_sends_in_order() {
        let (mock, radar) = initialized();
        let done = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&done);
        radar.init_transfer_out(move |_: &[u8]| *counter.lock().unwrap() += 1, 1);

        radar.set_gain_async(Gain::Level1).unwrap();
        radar.set_gain_async(Gain::Level5).unwrap();
        assert_eq!(sent_out(&mock), vec![0x32]);

        radar.run_single().unwrap();
        assert_eq!(sent_out(&mock), vec![0x32, 0x36]);
        assert_eq!(*done.lock().unwrap(), 2);
        assert_eq!(mock.pending(Direction::Out), 0);
    }

    #[test]
    fn test_reject_policy() {
        let (mock, radar) = radar_with(RadarConfig {
            pending_policy: PendingPolicy::Reject,
            ..Default::default()
        });
        radar.init_transfer_out(|_: &[u8]| {}, 1);
        radar.set_gain_async(Gain::Level1).unwrap();
        assert!(matches!(
            radar.set_gain_async(Gain::Level2),
            Err(RadarError::TransferPending {
                direction: Direction::Out
            })
        ));
        assert_eq!(sent_out(&mock), vec![0x32]);
    }

    #[test]
    fn test_queue_depth_bound() {
        let (_mock, radar) = radar_with(RadarConfig {
            outbound_queue_depth: 1,
            ..Default::default()
        });
        radar.init_transfer_out(|_: &[u8]| {}, 1);
        radar.set_gain_async(Gain::Level1).unwrap();
        radar.set_gain_async(Gain::Level2).unwrap();
        assert!(matches!(
            radar.set_gain_async(Gain::Level3),
            Err(RadarError::QueueFull { depth: 1 })
        ));
    }

    #[test]
    fn test_submit_failure_leaves_nothing_pending() {
        let (mock, radar) = initialized();
        radar.init_transfer_out(|_: &[u8]| {}, 1);
        mock.fail_next_submit(Direction::Out);
        assert!(matches!(
            radar.set_gain_async(Gain::Level1),
            Err(RadarError::Io(TransportError::SubmitFailed { .. }))
        ));
        radar.set_gain_async(Gain::Level2).unwrap();
        assert_eq!(sent_out(&mock), vec![0x33]);
    }

    #[test]
    fn test_register_in_requires_arm() {
        let (_mock, radar) = initialized();
        assert!(matches!(
            radar.register_transfer_in(),
            Err(RadarError::ConfigurationEmpty(_))
        ));
        radar.init_transfer_in(|_: &[u8]| {}, 0);
        assert!(matches!(
            radar.register_transfer_in(),
            Err(RadarError::ConfigurationEmpty(_))
        ));
    }

    #[test]
    fn test_inbound_rearms_before_handler() {
        let (mock, radar) = initialized();
        let watcher = Arc::clone(&mock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        radar.init_transfer_in(
            move |data: &[u8]| {
                sink.lock()
                    .unwrap()
                    .push((data.len(), watcher.pending(Direction::In)));
            },
            600,
        );
        radar.register_transfer_in().unwrap();

        mock.queue_inbound(&[7u8; 585]);
        mock.queue_inbound(&[8u8; 585]);
        radar.run_single().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(585, 1), (585, 1)]);
        assert_eq!(mock.pending(Direction::In), 1);
    }

    #[test]
    fn test_register_in_reuses_pending_under_queue() {
        let (mock, radar) = initialized();
        radar.init_transfer_in(|_: &[u8]| {}, 600);
        radar.register_transfer_in().unwrap();
        radar.register_transfer_in().unwrap();
        assert_eq!(mock.pending(Direction::In), 1);
    }

    #[test]
    fn test_register_in_rejects_under_reject() {
        let (_mock, radar) = radar_with(RadarConfig {
            pending_policy: PendingPolicy::Reject,
            ..Default::default()
        });
        radar.init_transfer_in(|_: &[u8]| {}, 600);
        radar.register_transfer_in().unwrap();
        assert!(matches!(
            radar.register_transfer_in(),
            Err(RadarError::TransferPending {
                direction: Direction::In
            })
        ));
    }

    #[test]
    fn test_start_io_inbound_failure_stays_initialized() {
        let (mock, radar) = initialized();
        mock.fail_next_submit(Direction::In);
        assert!(matches!(
            radar.start_io_async(
                TimeWindow::Short,
                Gain::Level2,
                |_: &[u8]| {},
                600,
                |_: &[u8]| {},
                1,
            ),
            Err(RadarError::Io(TransportError::SubmitFailed {
                direction: Direction::In,
                ..
            }))
        ));
        assert_eq!(radar.state(), DeviceState::Initialized);
        assert!(matches!(
            radar.run(),
            Err(RadarError::NotInitialized { .. })
        ));

        // A retry goes through once the inbound submit succeeds.
        radar.register_transfer_in().unwrap();
        assert_eq!(mock.pending(Direction::In), 1);
    }

    /// Re-arms the outbound direction from inside the observer callback.
    struct RearmOnCommand {
        radar: OnceLock<Weak<Radar>>,
        seen: Mutex<Vec<Command>>,
    }

    impl RadarObserver for RearmOnCommand {
        fn on_event(&self, event: &RadarEvent) {
            if let RadarEvent::CommandIssued { command, path } = event {
                assert_eq!(*path, CommandPath::Async);
                self.seen.lock().unwrap().push(*command);
                if let Some(radar) = self.radar.get().and_then(Weak::upgrade) {
                    radar.init_transfer_out(|_: &[u8]| {}, 1);
                }
            }
        }
    }

    #[test]
    fn test_observer_may_reenter_outbound_slot() {
        let bus = Arc::new(MockBus::new());
        let mock = bus.transport();
        let candidate = DeviceCandidate {
            vendor_id: OERAD_VENDOR_ID,
            product_id: OERAD_DEFAULT_PID,
            address: 1,
        };
        let observer = Arc::new(RearmOnCommand {
            radar: OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        let bus: Arc<dyn UsbBus> = bus;
        let radar = Arc::new(
            Radar::new(candidate, bus, RadarConfig::default()).with_observer(observer.clone()),
        );
        assert!(observer.radar.set(Arc::downgrade(&radar)).is_ok());
        radar.connect().unwrap();
        radar.initialize().unwrap();

        radar.init_transfer_out(|_: &[u8]| {}, 1);
        radar
            .start_transmission_async(TimeWindow::Long, Gain::Level1)
            .unwrap();
        // The queued gain is submitted, and reported, from the pump.
        radar.run_single().unwrap();

        assert_eq!(
            *observer.seen.lock().unwrap(),
            vec![
                Command::TimeWindow(TimeWindow::Long),
                Command::Gain(Gain::Level1)
            ]
        );
        assert_eq!(sent_out(&mock), vec![0x37, 0x32]);
    }

    #[test]
    fn test_stop_outside_running_is_noop() {
        let (_mock, radar) = initialized();
        radar.stop();
        assert_eq!(radar.state(), DeviceState::Initialized);
    }
}
