//! Radar error type.

use thiserror::Error;

use crate::state::{DeviceState, Operation};
use crate::transport::{Direction, TransportError};

#[derive(Error, Debug)]
pub enum RadarError {
    /// The radar has not reached the state `operation` needs.
    #[error("Cannot {operation}: requires {required}, radar is {actual}")]
    NotInitialized {
        operation: Operation,
        required: DeviceState,
        actual: DeviceState,
    },

    /// Transport-level open/claim/submit/transfer/cancel/release failure.
    #[error("I/O error: {0}")]
    Io(#[from] TransportError),

    /// A buffer or handler needed by the operation was never armed.
    #[error("{0} not set")]
    ConfigurationEmpty(&'static str),

    #[error("{direction} transfer already pending")]
    TransferPending { direction: Direction },

    #[error("Outbound command queue full ({depth} queued)")]
    QueueFull { depth: usize },

    #[error("No valid Oerad devices found")]
    NoDevices,
}

pub type Result<T> = std::result::Result<T, RadarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_initialized_display() {
        let e = RadarError::NotInitialized {
            operation: Operation::CaptureTrace,
            required: DeviceState::Transmitting,
            actual: DeviceState::Initialized,
        };
        assert_eq!(
            e.to_string(),
            "Cannot capture trace: requires TRANSMITTING, radar is INIT"
        );
    }

    #[test]
    fn test_transport_error_converts() {
        fn inner() -> std::result::Result<(), TransportError> {
            Err(TransportError::Disconnected)
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        assert!(matches!(
            outer(),
            Err(RadarError::Io(TransportError::Disconnected))
        ));
    }
}
