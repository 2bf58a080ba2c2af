//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow the radar lifecycle without hooking into the
//! transfer handlers.

use crate::protocol::Command;
use crate::state::DeviceState;
use crate::transport::Direction;

/// How a command reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPath {
    Sync,
    Async,
}

/// Events emitted by a radar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadarEvent {
    /// Interface claimed.
    Connected { vid: u16, pid: u16 },
    /// Interface released.
    Disconnected,
    /// Lifecycle state changed.
    StateChanged { from: DeviceState, to: DeviceState },
    /// Command written (sync) or submitted (async).
    CommandIssued { command: Command, path: CommandPath },
    /// Trace delivered to the inbound handler or a sync capture.
    TraceReceived { length: usize },
    /// An asynchronous transfer finished with an error status.
    TransferFailed { direction: Direction, message: String },
}

/// Observer trait for receiving radar events.
///
/// Called from whichever thread caused the event, including the pump
/// thread, so implementations must not block.
pub trait RadarObserver: Send + Sync {
    fn on_event(&self, event: &RadarEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl RadarObserver for NullObserver {
    fn on_event(&self, _event: &RadarEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl RadarObserver for TracingObserver {
    fn on_event(&self, event: &RadarEvent) {
        match event {
            RadarEvent::Connected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Radar connected");
            }
            RadarEvent::Disconnected => {
                tracing::info!("Radar disconnected");
            }
            RadarEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State transition");
            }
            RadarEvent::CommandIssued { command, path } => {
                tracing::debug!(command = %command, path = ?path, "Command issued");
            }
            RadarEvent::TraceReceived { length } => {
                tracing::trace!(length, "Trace received");
            }
            RadarEvent::TransferFailed { direction, message } => {
                tracing::warn!(dir = %direction, "Transfer failed: {}", message);
            }
        }
    }
}
