//! Radar handle and lifecycle: connect, initialize, disconnect.
//!
//! A [`Radar`] is created by a [`RadarContext`](crate::context::RadarContext)
//! for every supported device on the bus. It shares the context's bus, holds
//! the connection handle while connected and tracks its lifecycle state
//! atomically, so the event pump can run on one thread while commands are
//! issued from another.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, error, info, instrument, warn};

use crate::config::RadarConfig;
use crate::engine::slot::{InboundSlot, OutboundSlot};
use crate::error::{RadarError, Result};
use crate::events::{RadarEvent, RadarObserver, TracingObserver};
use crate::protocol::{Gain, TimeWindow, setup_sequence};
use crate::state::{AtomicState, DeviceState, Operation};
use crate::transport::{DeviceCandidate, TransportError, UsbBus, UsbTransport};

/// Last time window and gain requested, whether or not the device took them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub time_window: Option<TimeWindow>,
    pub gain: Option<Gain>,
}

pub struct Radar {
    candidate: Option<DeviceCandidate>,
    bus: Arc<dyn UsbBus>,
    pub(crate) config: RadarConfig,
    observer: Arc<dyn RadarObserver>,
    wireless: bool,
    state: AtomicState,
    settings: Mutex<Settings>,
    transport: RwLock<Option<Arc<dyn UsbTransport>>>,
    pub(crate) inbound: Mutex<InboundSlot>,
    pub(crate) outbound: Mutex<OutboundSlot>,
}

impl Radar {
    /// A radar for `candidate`, starting in `OnBus`.
    pub fn new(candidate: DeviceCandidate, bus: Arc<dyn UsbBus>, config: RadarConfig) -> Self {
        Self::build(Some(candidate), DeviceState::OnBus, bus, config)
    }

    /// A radar not bound to any device. Every operation on it fails with
    /// `NotInitialized`.
    pub fn unbound(bus: Arc<dyn UsbBus>, config: RadarConfig) -> Self {
        Self::build(None, DeviceState::NoDevice, bus, config)
    }

    fn build(
        candidate: Option<DeviceCandidate>,
        state: DeviceState,
        bus: Arc<dyn UsbBus>,
        config: RadarConfig,
    ) -> Self {
        Self {
            candidate,
            bus,
            config,
            observer: Arc::new(TracingObserver),
            wireless: false,
            state: AtomicState::new(state),
            settings: Mutex::new(Settings::default()),
            transport: RwLock::new(None),
            inbound: Mutex::new(InboundSlot::default()),
            outbound: Mutex::new(OutboundSlot::default()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RadarObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Mark the radar as attached through a wireless bridge.
    pub fn with_wireless(mut self, wireless: bool) -> Self {
        self.wireless = wireless;
        self
    }

    pub fn state(&self) -> DeviceState {
        self.state.load()
    }

    pub fn settings(&self) -> Settings {
        *lock(&self.settings)
    }

    pub fn config(&self) -> &RadarConfig {
        &self.config
    }

    pub fn candidate(&self) -> Option<&DeviceCandidate> {
        self.candidate.as_ref()
    }

    pub fn is_wireless(&self) -> bool {
        self.wireless
    }

    /// Open the device and claim its interface. A no-op when already
    /// connected.
    #[instrument(skip(self), fields(device = ?self.candidate))]
    pub fn connect(&self) -> Result<()> {
        let state = self.require(Operation::Connect)?;
        if state.is_connected() {
            debug!(state = %state, "Already connected");
            return Ok(());
        }
        let Some(candidate) = self.candidate.as_ref() else {
            return Err(not_permitted(Operation::Connect, state));
        };

        let transport = self.bus.open(candidate).map_err(|e| {
            error!(error = %e, "Could not open radar");
            e
        })?;
        let (vid, pid) = (transport.vendor_id(), transport.product_id());
        *self.transport_slot_mut() = Some(transport);

        info!(device = %candidate, "Claimed interface");
        self.emit(RadarEvent::Connected { vid, pid });
        self.goto_state(DeviceState::Connected);
        Ok(())
    }

    /// Configure the UART bridge with the vendor control sequence.
    ///
    /// A failing step aborts unless `tolerate_setup_errors` is set, in which
    /// case it is logged and the sequence carries on.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<()> {
        self.require(Operation::Initialize)?;
        let transport = self.transport()?;
        let timeout = self.config.control_timeout();

        for step in setup_sequence() {
            match transport.control_out(&step.request, timeout) {
                Ok(()) => debug!(step = step.name, "Setup step done"),
                Err(e) if self.config.tolerate_setup_errors => {
                    warn!(step = step.name, error = %e, "Setup step failed, continuing");
                }
                Err(e) => {
                    error!(step = step.name, error = %e, "Setup step failed");
                    return Err(e.into());
                }
            }
        }

        self.advance_to(DeviceState::Initialized);
        Ok(())
    }

    /// Cancel pending transfers and release the interface.
    ///
    /// On failure the radar keeps its state and its connection handle.
    #[instrument(skip(self))]
    pub fn disconnect(&self) -> Result<()> {
        self.require(Operation::Disconnect)?;
        let transport = self.transport()?;

        let in_token = lock(&self.inbound).pending;
        let out_token = lock(&self.outbound).pending.map(|(token, _)| token);

        let mut failure: Option<TransportError> = None;
        for token in [in_token, out_token].into_iter().flatten() {
            match transport.cancel(token) {
                Ok(()) => debug!(%token, "Cancelled transfer"),
                Err(e) => {
                    error!(%token, error = %e, "Could not cancel transfer");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            return Err(e.into());
        }

        transport.release().map_err(|e| {
            error!(error = %e, "Could not release interface");
            e
        })?;

        {
            let mut inbound = lock(&self.inbound);
            inbound.pending = None;
            inbound.spare = None;
        }
        {
            let mut outbound = lock(&self.outbound);
            outbound.pending = None;
            outbound.queue.clear();
        }
        *self.transport_slot_mut() = None;

        info!("Released interface");
        self.emit(RadarEvent::Disconnected);
        self.goto_state(DeviceState::OnBus);
        Ok(())
    }

    /// Current state if it permits `op`.
    pub(crate) fn require(&self, op: Operation) -> Result<DeviceState> {
        let state = self.state();
        if state.permits(op) {
            Ok(state)
        } else {
            debug!(operation = %op, state = %state, "Operation refused");
            Err(not_permitted(op, state))
        }
    }

    pub(crate) fn transport(&self) -> Result<Arc<dyn UsbTransport>> {
        let slot = match self.transport.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
            .ok_or(RadarError::Io(TransportError::Disconnected))
    }

    fn transport_slot_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn UsbTransport>>> {
        match self.transport.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut lock(&self.settings));
    }

    pub(crate) fn emit(&self, event: RadarEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn goto_state(&self, to: DeviceState) {
        let from = self.state.swap(to);
        if from != to {
            info!(from = %from, to = %to, "State transition");
            self.emit(RadarEvent::StateChanged { from, to });
        }
    }

    /// Move to `to` unless already there or beyond.
    pub(crate) fn advance_to(&self, to: DeviceState) {
        if self.state() < to {
            self.goto_state(to);
        }
    }

    /// Move from `from` to `to` if no other thread changed the state.
    pub(crate) fn transition(&self, from: DeviceState, to: DeviceState) -> bool {
        let moved = self.state.transition(from, to);
        if moved {
            info!(from = %from, to = %to, "State transition");
            self.emit(RadarEvent::StateChanged { from, to });
        }
        moved
    }
}

impl Drop for Radar {
    fn drop(&mut self) {
        let held = match self.transport.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(transport) = held {
            warn!("Radar dropped while connected, releasing interface");
            if let Err(e) = transport.release() {
                error!(error = %e, "Could not release interface");
            }
        }
    }
}

fn not_permitted(operation: Operation, actual: DeviceState) -> RadarError {
    RadarError::NotInitialized {
        operation,
        required: operation.min_state(),
        actual,
    }
}

/// Lock ignoring poison: slot contents stay consistent across a panicking
/// handler because handlers run outside the lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::constants::{OERAD_DEFAULT_PID, OERAD_VENDOR_ID};
    use crate::transport::{MockBus, MockTransport};

    fn radar_on(bus: &Arc<MockBus>, config: RadarConfig) -> Radar {
        let candidate = DeviceCandidate {
            vendor_id: OERAD_VENDOR_ID,
            product_id: OERAD_DEFAULT_PID,
            address: 1,
        };
        let bus: Arc<dyn UsbBus> = bus.clone();
        Radar::new(candidate, bus, config).with_observer(Arc::new(NullObserver))
    }

    fn setup() -> (Arc<MockBus>, Arc<MockTransport>, Radar) {
        let bus = Arc::new(MockBus::new());
        let mock = bus.transport();
        let radar = radar_on(&bus, RadarConfig::default());
        (bus, mock, radar)
    }

    #[test]
    fn test_connect_and_initialize() {
        let (bus, mock, radar) = setup();
        assert_eq!(radar.state(), DeviceState::OnBus);

        radar.connect().unwrap();
        assert_eq!(radar.state(), DeviceState::Connected);
        assert_eq!(bus.open_count(), 1);

        radar.initialize().unwrap();
        assert_eq!(radar.state(), DeviceState::Initialized);
        let requests: Vec<u8> = mock.get_controls().iter().map(|c| c.request).collect();
        assert_eq!(requests, vec![0x00, 0x07, 0x01, 0x1E, 0x03]);
    }

    #[test]
    fn test_connect_twice_is_noop() {
        let (bus, _mock, radar) = setup();
        radar.connect().unwrap();
        radar.connect().unwrap();
        assert_eq!(bus.open_count(), 1);
        assert_eq!(radar.state(), DeviceState::Connected);
    }

    #[test]
    fn test_connect_failure_keeps_state() {
        let (bus, _mock, radar) = setup();
        bus.set_fail_open(true);
        let err = radar.connect().unwrap_err();
        assert!(matches!(
            err,
            RadarError::Io(TransportError::ClaimInterfaceFailed { .. })
        ));
        assert_eq!(radar.state(), DeviceState::OnBus);
    }

    #[test]
    fn test_unbound_radar_refuses_everything() {
        let bus: Arc<dyn UsbBus> = Arc::new(MockBus::new());
        let radar = Radar::unbound(bus, RadarConfig::default());
        assert!(matches!(
            radar.connect(),
            Err(RadarError::NotInitialized {
                actual: DeviceState::NoDevice,
                ..
            })
        ));
        assert!(radar.disconnect().is_err());
    }

    #[test]
    fn test_initialize_before_connect() {
        let (_bus, mock, radar) = setup();
        assert!(matches!(
            radar.initialize(),
            Err(RadarError::NotInitialized { .. })
        ));
        assert!(mock.get_controls().is_empty());
    }

    #[test]
    fn test_setup_failure_is_fatal_by_default() {
        let (_bus, mock, radar) = setup();
        radar.connect().unwrap();
        mock.fail_control(0x07);

        assert!(radar.initialize().is_err());
        assert_eq!(radar.state(), DeviceState::Connected);
        // Aborted after the failing step.
        assert_eq!(mock.get_controls().len(), 2);
    }

    #[test]
    fn test_setup_failure_tolerated() {
        let bus = Arc::new(MockBus::new());
        let mock = bus.transport();
        let config = RadarConfig {
            tolerate_setup_errors: true,
            ..Default::default()
        };
        let radar = radar_on(&bus, config);
        radar.connect().unwrap();
        mock.fail_control(0x07);

        radar.initialize().unwrap();
        assert_eq!(radar.state(), DeviceState::Initialized);
        assert_eq!(mock.get_controls().len(), 5);
    }

    #[test]
    fn test_disconnect_releases_once() {
        let (_bus, mock, radar) = setup();
        radar.connect().unwrap();
        radar.disconnect().unwrap();
        assert_eq!(radar.state(), DeviceState::OnBus);
        assert_eq!(mock.release_count(), 1);
        assert!(mock.cancelled().is_empty());

        // Dropping afterwards must not release again.
        drop(radar);
        assert_eq!(mock.release_count(), 1);
    }

    #[test]
    fn test_drop_while_connected_releases() {
        let (_bus, mock, radar) = setup();
        radar.connect().unwrap();
        drop(radar);
        assert_eq!(mock.release_count(), 1);
    }

    #[test]
    fn test_disconnect_release_failure() {
        let (_bus, mock, radar) = setup();
        radar.connect().unwrap();
        radar.initialize().unwrap();
        mock.set_fail_release(true);

        assert!(matches!(
            radar.disconnect(),
            Err(RadarError::Io(TransportError::ReleaseFailed { .. }))
        ));
        assert_eq!(radar.state(), DeviceState::Initialized);
        mock.set_fail_release(false);
    }

    #[test]
    fn test_wireless_flag() {
        let (_bus, _mock, radar) = setup();
        assert!(!radar.is_wireless());
        let radar = radar.with_wireless(true);
        assert!(radar.is_wireless());
    }
}
