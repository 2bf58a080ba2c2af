//! Radar lifecycle state machine.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a radar. Ordered: later states imply earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceState {
    /// Not associated with an address on the bus.
    NoDevice,
    /// Seen on the bus, not opened.
    OnBus,
    /// Opened, interface claimed.
    Connected,
    /// UART bridge configured.
    Initialized,
    /// Time window and gain sent, radar acquiring.
    Transmitting,
    /// Event pump loop active.
    Running,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::NoDevice
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::NoDevice => write!(f, "NO_DEV"),
            DeviceState::OnBus => write!(f, "ON_BUS"),
            DeviceState::Connected => write!(f, "CONNECTED"),
            DeviceState::Initialized => write!(f, "INIT"),
            DeviceState::Transmitting => write!(f, "TRANSMITTING"),
            DeviceState::Running => write!(f, "RUNNING"),
        }
    }
}

impl DeviceState {
    const ALL: [DeviceState; 6] = [
        DeviceState::NoDevice,
        DeviceState::OnBus,
        DeviceState::Connected,
        DeviceState::Initialized,
        DeviceState::Transmitting,
        DeviceState::Running,
    ];

    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        Self::ALL
            .get(v as usize)
            .copied()
            .unwrap_or(DeviceState::NoDevice)
    }

    /// Whether `op` may run in this state.
    pub fn permits(self, op: Operation) -> bool {
        self >= op.min_state()
    }

    /// Whether a connection handle is held in this state.
    pub fn is_connected(self) -> bool {
        self >= DeviceState::Connected
    }
}

/// State-gated radar operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Initialize,
    StartTransmission,
    SendSignal,
    ArmTransfer,
    RegisterTransferIn,
    IssueAsyncCommand,
    CaptureTrace,
    RunLoop,
    Disconnect,
}

impl Operation {
    /// Lowest state in which the operation is allowed.
    pub const fn min_state(self) -> DeviceState {
        match self {
            Operation::Connect => DeviceState::OnBus,
            Operation::Initialize => DeviceState::Connected,
            Operation::StartTransmission => DeviceState::Initialized,
            Operation::SendSignal => DeviceState::Initialized,
            Operation::ArmTransfer => DeviceState::Initialized,
            Operation::RegisterTransferIn => DeviceState::Initialized,
            Operation::IssueAsyncCommand => DeviceState::Connected,
            Operation::CaptureTrace => DeviceState::Transmitting,
            Operation::RunLoop => DeviceState::Transmitting,
            Operation::Disconnect => DeviceState::Connected,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Initialize => "initialize",
            Operation::StartTransmission => "start transmission",
            Operation::SendSignal => "send signal",
            Operation::ArmTransfer => "arm transfer",
            Operation::RegisterTransferIn => "register IN transfer",
            Operation::IssueAsyncCommand => "issue async command",
            Operation::CaptureTrace => "capture trace",
            Operation::RunLoop => "run event loop",
            Operation::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Atomically shared [`DeviceState`].
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: DeviceState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one.
    pub fn swap(&self, state: DeviceState) -> DeviceState {
        DeviceState::from_u8(self.0.swap(state.as_u8(), Ordering::AcqRel))
    }

    /// Move from `from` to `to` only if the state is still `from`.
    pub fn transition(&self, from: DeviceState, to: DeviceState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicState {
    fn default() -> Self {
        Self::new(DeviceState::NoDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(DeviceState::NoDevice < DeviceState::OnBus);
        assert!(DeviceState::Initialized < DeviceState::Transmitting);
        assert!(DeviceState::Transmitting < DeviceState::Running);
    }

    #[test]
    fn test_permits() {
        assert!(!DeviceState::Connected.permits(Operation::SendSignal));
        assert!(DeviceState::Initialized.permits(Operation::SendSignal));
        assert!(DeviceState::Running.permits(Operation::SendSignal));
        assert!(!DeviceState::Initialized.permits(Operation::CaptureTrace));
        assert!(!DeviceState::NoDevice.permits(Operation::Connect));
        assert!(!DeviceState::OnBus.permits(Operation::Disconnect));
    }

    #[test]
    fn test_atomic_roundtrip_every_state() {
        let s = AtomicState::default();
        for state in DeviceState::ALL {
            s.swap(state);
            assert_eq!(s.load(), state);
        }
    }

    #[test]
    fn test_transition_only_from_expected() {
        let s = AtomicState::new(DeviceState::Running);
        assert!(!s.transition(DeviceState::Transmitting, DeviceState::Running));
        assert!(s.transition(DeviceState::Running, DeviceState::Transmitting));
        assert_eq!(s.load(), DeviceState::Transmitting);
    }
}
