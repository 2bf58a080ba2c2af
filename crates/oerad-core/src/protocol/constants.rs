//! Protocol constants for the Oerad GPR front end.
//!
//! The radar sits behind a CP210x-style USB/UART bridge, so the setup
//! requests below are the bridge's vendor requests.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Bridge vendor ID (4292).
pub const OERAD_VENDOR_ID: u16 = 0x10C4;

/// Default bridge PID (60000).
pub const OERAD_DEFAULT_PID: u16 = 0xEA60;
pub const OERAD_PID_8A9F: u16 = 0x8A9F;
pub const OERAD_PID_8AA0: u16 = 0x8AA0;
pub const OERAD_PID_8AA1: u16 = 0x8AA1;
pub const OERAD_PID_8AA2: u16 = 0x8AA2;

/// All supported PIDs for device discovery
pub const SUPPORTED_PIDS: &[u16] = &[
    OERAD_DEFAULT_PID,
    OERAD_PID_8A9F,
    OERAD_PID_8AA0,
    OERAD_PID_8AA1,
    OERAD_PID_8AA2,
];

/// Check a VID/PID pair against the identity filter.
pub fn is_supported(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == OERAD_VENDOR_ID && SUPPORTED_PIDS.contains(&product_id)
}

// ============================================================================
// Endpoints
// ============================================================================

pub const INTERFACE_NUMBER: u8 = 0;
pub const ENDPOINT_OUT: u8 = 0x01;
pub const ENDPOINT_IN: u8 = 0x81;

// ============================================================================
// Frame sizes
// ============================================================================

/// Canonical length of one radar trace.
pub const TRACE_LENGTH: usize = 585;

/// Smallest inbound buffer that reliably holds a trace.
pub const MIN_BUFFER_IN_SIZE: usize = 600;

/// Every command is a single byte.
pub const COMMAND_LENGTH: usize = 1;

// ============================================================================
// Retry counts
// ============================================================================

/// Blocking reads performed by one synchronous trace capture.
pub const TRACE_ATTEMPTS: usize = 5;

/// Pump iterations performed by one single-shot asynchronous capture.
pub const SINGLE_PUMP_ITERATIONS: usize = 5;

// ============================================================================
// Timeouts
// ============================================================================

pub const SIGNAL_TIMEOUT: Duration = Duration::from_millis(400);
pub const TRACE_TIMEOUT: Duration = Duration::from_millis(600);
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(5000);
pub const PUMP_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// UART bridge setup (vendor requests, host -> device, interface recipient)
// ============================================================================

/// bmRequestType used by every setup request.
pub const SETUP_REQUEST_TYPE: u8 = 0x41;

pub const REQ_IFC_ENABLE: u8 = 0x00;
pub const REQ_SET_BAUDDIV: u8 = 0x01;
pub const REQ_SET_LINE_CTL: u8 = 0x03;
pub const REQ_SET_MHS: u8 = 0x07;
pub const REQ_SET_BAUDRATE: u8 = 0x1E;

pub const UART_ENABLE: u16 = 0x0001;
pub const MHS_DTR_RTS: u16 = 0x0303;
pub const BAUD_DIVISOR: u16 = 0x0020;
/// 8 data bits, no parity, one stop bit.
pub const LINE_CTL_8N1: u16 = 0x0800;

pub const BAUD_RATE: u32 = 115_200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_filter() {
        assert!(is_supported(4292, 60000));
        for pid in SUPPORTED_PIDS {
            assert!(is_supported(OERAD_VENDOR_ID, *pid));
        }
        assert!(!is_supported(OERAD_VENDOR_ID, 0x8AA3));
        assert!(!is_supported(0x8086, OERAD_DEFAULT_PID));
    }

    #[test]
    fn test_min_buffer_holds_trace() {
        assert!(MIN_BUFFER_IN_SIZE >= TRACE_LENGTH);
    }
}
