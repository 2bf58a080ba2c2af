//! USB Transport layer abstraction.
//!
//! Defines the `UsbBus` and `UsbTransport` traits the radar core is written
//! against, allowing different implementations (nusb, mock, etc.).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Failed to release interface {interface}: {message}")]
    ReleaseFailed { interface: u8, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Control transfer 0x{request:02X} failed: {message}")]
    ControlFailed { request: u8, message: String },

    #[error("Failed to submit {direction} transfer: {message}")]
    SubmitFailed {
        direction: Direction,
        message: String,
    },

    #[error("Failed to cancel transfer {token}: {message}")]
    CancelFailed {
        token: TransferToken,
        message: String,
    },

    #[error("Event handling failed: {0}")]
    EventsFailed(String),

    #[error("{direction} endpoint busy with pending transfers")]
    Busy { direction: Direction },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// Handle to one submitted asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(pub u64);

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of an asynchronous transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Cancelled,
    Failed(String),
}

/// A finished asynchronous transfer, handing its buffer back.
#[derive(Debug)]
pub struct Completion {
    pub token: TransferToken,
    pub direction: Direction,
    /// The submitted buffer. For IN transfers the first `actual_len`
    /// bytes hold received data.
    pub buffer: Vec<u8>,
    pub actual_len: usize,
    pub status: CompletionStatus,
}

impl Completion {
    /// The transferred bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_len.min(self.buffer.len())]
    }
}

/// Host-to-device vendor control request addressed to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

/// A device seen on the bus, before it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub vendor_id: u16,
    pub product_id: u16,
    pub address: u8,
}

impl fmt::Display for DeviceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} @ {:03}",
            self.vendor_id, self.product_id, self.address
        )
    }
}

/// Bus-level access: enumeration and opening.
pub trait UsbBus: Send + Sync {
    /// List every device currently on the bus.
    fn devices(&self) -> Result<Vec<DeviceCandidate>, TransportError>;

    /// Open a candidate, detach any kernel driver bound to the radar
    /// interface and claim it.
    fn open(&self, candidate: &DeviceCandidate) -> Result<Arc<dyn UsbTransport>, TransportError>;
}

/// An opened, claimed device.
///
/// Asynchronous transfers are submitted with [`submit`](Self::submit) and
/// handed back by [`handle_events`](Self::handle_events) in submission
/// order per direction.
pub trait UsbTransport: Send + Sync {
    /// Blocking bulk OUT write. Returns the number of bytes transferred.
    fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Blocking bulk IN read into `buf`. Returns the number of bytes read.
    fn bulk_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Blocking vendor control OUT request.
    fn control_out(&self, request: &ControlRequest, timeout: Duration)
    -> Result<(), TransportError>;

    /// Submit a non-blocking bulk transfer. For `Direction::In` the
    /// buffer length is the requested length.
    fn submit(&self, direction: Direction, buffer: Vec<u8>)
    -> Result<TransferToken, TransportError>;

    /// Request cancellation of a pending transfer. The cancelled transfer
    /// is still reported by a later `handle_events` call.
    fn cancel(&self, token: TransferToken) -> Result<(), TransportError>;

    /// Block until at least one transfer completes or `timeout` elapses.
    fn handle_events(&self, timeout: Duration) -> Result<Vec<Completion>, TransportError>;

    /// Release the claimed interface.
    fn release(&self) -> Result<(), TransportError>;

    /// Get the VID.
    fn vendor_id(&self) -> u16;

    /// Get the PID.
    fn product_id(&self) -> u16;
}
