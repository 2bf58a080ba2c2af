//! nusb-based USB transport implementation.
//!
//! nusb 0.2 endpoints take `&mut self` for submission and reaping, so each
//! endpoint lives behind its own mutex. The event pump polls both endpoints
//! in short slices, which keeps `submit` from one thread responsive while
//! another thread sits in `handle_events`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use nusb::transfer::{
    Buffer, Bulk, ControlOut, ControlType, In, Out, Recipient, TransferError,
};
use nusb::{Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{
    Completion, CompletionStatus, ControlRequest, DeviceCandidate, Direction, TransferToken,
    TransportError, UsbBus, UsbTransport,
};
use crate::protocol::constants::{ENDPOINT_IN, ENDPOINT_OUT, INTERFACE_NUMBER};

/// Longest single wait on one endpoint inside `handle_events`.
const PUMP_SLICE: Duration = Duration::from_millis(10);

/// How long to wait for a cancelled blocking transfer to be reaped.
const CANCEL_REAP_TIMEOUT: Duration = Duration::from_millis(100);

/// The system USB bus, enumerated through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBus;

impl NusbBus {
    pub fn new() -> Self {
        Self
    }
}

impl UsbBus for NusbBus {
    #[instrument(level = "debug", skip(self))]
    fn devices(&self) -> Result<Vec<DeviceCandidate>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        Ok(devices
            .map(|d| DeviceCandidate {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                address: d.device_address(),
            })
            .collect())
    }

    #[instrument(level = "info", skip(self), fields(device = %candidate))]
    fn open(&self, candidate: &DeviceCandidate) -> Result<Arc<dyn UsbTransport>, TransportError> {
        let transport: Arc<dyn UsbTransport> = Arc::new(NusbTransport::open(candidate)?);
        Ok(transport)
    }
}

/// Bookkeeping for transfers in flight on one endpoint, oldest first,
/// with the length the caller asked for.
#[derive(Default)]
struct InFlight {
    transfers: VecDeque<(TransferToken, usize)>,
}

impl InFlight {
    fn contains(&self, token: TransferToken) -> bool {
        self.transfers.iter().any(|(t, _)| *t == token)
    }
}

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Mutex<Option<Interface>>,
    ep_in: Mutex<Option<Endpoint<Bulk, In>>>,
    ep_out: Mutex<Option<Endpoint<Bulk, Out>>>,
    in_flight_in: Mutex<InFlight>,
    in_flight_out: Mutex<InFlight>,
    next_token: AtomicU64,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the device behind `candidate` and claim the radar interface.
    pub fn open(candidate: &DeviceCandidate) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| {
                d.vendor_id() == candidate.vendor_id
                    && d.product_id() == candidate.product_id
                    && d.device_address() == candidate.address
            })
            .ok_or(TransportError::DeviceNotFound {
                vid: candidate.vendor_id,
                pid: candidate.product_id,
            })?;

        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // Drops any kernel driver bound to the bridge before claiming.
        let interface = device
            .detach_and_claim_interface(INTERFACE_NUMBER)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: INTERFACE_NUMBER,
                message: e.to_string(),
            })?;

        let ep_in = interface
            .endpoint::<Bulk, In>(ENDPOINT_IN)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let ep_out = interface
            .endpoint::<Bulk, Out>(ENDPOINT_OUT)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            in_ep = %format!("0x{:02X}", ENDPOINT_IN),
            out_ep = %format!("0x{:02X}", ENDPOINT_OUT),
            "Device opened successfully"
        );

        Ok(Self {
            interface: Mutex::new(Some(interface)),
            ep_in: Mutex::new(Some(ep_in)),
            ep_out: Mutex::new(Some(ep_out)),
            in_flight_in: Mutex::new(InFlight::default()),
            in_flight_out: Mutex::new(InFlight::default()),
            next_token: AtomicU64::new(1),
            vid,
            pid,
        })
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        // A panic in another thread must not wedge the transport.
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self, direction: Direction) -> MutexGuard<'_, InFlight> {
        match direction {
            Direction::In => Self::lock(&self.in_flight_in),
            Direction::Out => Self::lock(&self.in_flight_out),
        }
    }

    fn next_token(&self) -> TransferToken {
        TransferToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn convert(&self, direction: Direction, c: nusb::transfer::Completion) -> Completion {
        let (token, requested) = self
            .in_flight(direction)
            .transfers
            .pop_front()
            .unwrap_or((TransferToken(0), c.buffer.len()));
        let actual_len = clamp_len(c.actual_len, requested, c.buffer.len());
        let status = match c.status {
            Ok(()) => CompletionStatus::Completed,
            Err(TransferError::Cancelled) => CompletionStatus::Cancelled,
            Err(e) => CompletionStatus::Failed(e.to_string()),
        };
        let buffer = match direction {
            Direction::In => c.buffer[..actual_len].to_vec(),
            Direction::Out => c.buffer.to_vec(),
        };
        Completion {
            token,
            direction,
            buffer,
            actual_len,
            status,
        }
    }
}

/// IN requests are padded to whole packets; never report more than the
/// caller asked for.
fn clamp_len(actual: usize, requested: usize, buffer_len: usize) -> usize {
    actual.min(requested).min(buffer_len)
}

fn round_up_to_max_packet(len: usize, max_packet_size: usize) -> usize {
    len.max(1).div_ceil(max_packet_size.max(1)) * max_packet_size.max(1)
}

fn write_blocking(
    ep: &mut Endpoint<Bulk, Out>,
    buf: Buffer,
    timeout: Duration,
) -> Option<nusb::transfer::Completion> {
    ep.submit(buf);
    let completion = ep.wait_next_complete(timeout);
    if completion.is_none() {
        ep.cancel_all();
        // Reap the cancelled transfer so the endpoint is idle again.
        let _ = ep.wait_next_complete(CANCEL_REAP_TIMEOUT);
    }
    completion
}

fn read_blocking(
    ep: &mut Endpoint<Bulk, In>,
    buf: Buffer,
    timeout: Duration,
) -> Option<nusb::transfer::Completion> {
    ep.submit(buf);
    let completion = ep.wait_next_complete(timeout);
    if completion.is_none() {
        ep.cancel_all();
        let _ = ep.wait_next_complete(CANCEL_REAP_TIMEOUT);
    }
    completion
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut guard = Self::lock(&self.ep_out);
        let ep = guard.as_mut().ok_or(TransportError::Disconnected)?;
        if ep.pending() > 0 {
            return Err(TransportError::Busy {
                direction: Direction::Out,
            });
        }

        let completion = write_blocking(ep, Buffer::from(data.to_vec()), timeout).ok_or(
            TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
        )?;
        completion
            .status
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = completion.actual_len, "Write complete");
        Ok(completion.actual_len)
    }

    #[instrument(skip(self, buf), fields(max_len = buf.len()))]
    fn bulk_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut guard = Self::lock(&self.ep_in);
        let ep = guard.as_mut().ok_or(TransportError::Disconnected)?;
        if ep.pending() > 0 {
            return Err(TransportError::Busy {
                direction: Direction::In,
            });
        }

        let requested = round_up_to_max_packet(buf.len(), ep.max_packet_size());
        let mut request = Buffer::new(requested);
        request.set_requested_len(requested);

        let completion = read_blocking(ep, request, timeout).ok_or(
            TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
        )?;
        completion
            .status
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let n = completion.actual_len.min(buf.len());
        buf[..n].copy_from_slice(&completion.buffer[..n]);
        debug!(bytes_read = n, "Read complete");
        Ok(n)
    }

    #[instrument(skip(self, request), fields(request = %format!("0x{:02X}", request.request)))]
    fn control_out(
        &self,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let guard = Self::lock(&self.interface);
        let interface = guard.as_ref().ok_or(TransportError::Disconnected)?;

        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data: &request.data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: request.request,
                message: e.to_string(),
            })
    }

    fn submit(
        &self,
        direction: Direction,
        buffer: Vec<u8>,
    ) -> Result<TransferToken, TransportError> {
        let token = self.next_token();
        match direction {
            Direction::In => {
                let mut guard = Self::lock(&self.ep_in);
                let ep = guard.as_mut().ok_or(TransportError::SubmitFailed {
                    direction,
                    message: "interface released".into(),
                })?;
                let requested = round_up_to_max_packet(buffer.len(), ep.max_packet_size());
                let mut request = Buffer::new(requested);
                request.set_requested_len(requested);
                self.in_flight(direction)
                    .transfers
                    .push_back((token, buffer.len()));
                ep.submit(request);
            }
            Direction::Out => {
                let mut guard = Self::lock(&self.ep_out);
                let ep = guard.as_mut().ok_or(TransportError::SubmitFailed {
                    direction,
                    message: "interface released".into(),
                })?;
                self.in_flight(direction)
                    .transfers
                    .push_back((token, buffer.len()));
                ep.submit(Buffer::from(buffer));
            }
        }
        debug!(%direction, %token, "Transfer submitted");
        Ok(token)
    }

    fn cancel(&self, token: TransferToken) -> Result<(), TransportError> {
        // nusb cancels per endpoint; at most one transfer is in flight per
        // direction, so cancelling the owning endpoint cancels `token`.
        if self.in_flight(Direction::In).contains(token) {
            if let Some(ep) = Self::lock(&self.ep_in).as_mut() {
                ep.cancel_all();
            }
        } else if self.in_flight(Direction::Out).contains(token) {
            if let Some(ep) = Self::lock(&self.ep_out).as_mut() {
                ep.cancel_all();
            }
        } else {
            debug!(%token, "Cancel requested for transfer no longer in flight");
        }
        Ok(())
    }

    fn handle_events(&self, timeout: Duration) -> Result<Vec<Completion>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut completions = Vec::new();

        loop {
            let mut any_pending = false;

            {
                let mut guard = Self::lock(&self.ep_in);
                let ep = guard.as_mut().ok_or(TransportError::Disconnected)?;
                if ep.pending() > 0 {
                    any_pending = true;
                    if let Some(c) = ep.wait_next_complete(PUMP_SLICE) {
                        completions.push(self.convert(Direction::In, c));
                    }
                }
            }
            {
                let mut guard = Self::lock(&self.ep_out);
                let ep = guard.as_mut().ok_or(TransportError::Disconnected)?;
                while ep.pending() > 0 {
                    any_pending = true;
                    match ep.wait_next_complete(Duration::ZERO) {
                        Some(c) => completions.push(self.convert(Direction::Out, c)),
                        None => break,
                    }
                }
            }

            if !completions.is_empty() || Instant::now() >= deadline {
                return Ok(completions);
            }
            if !any_pending {
                thread::sleep(PUMP_SLICE);
            }
        }
    }

    fn release(&self) -> Result<(), TransportError> {
        // Dropping the endpoints and the interface releases the claim.
        Self::lock(&self.ep_in).take();
        Self::lock(&self.ep_out).take();
        if Self::lock(&self.interface).take().is_none() {
            warn!("Interface already released");
        }
        self.in_flight(Direction::In).transfers.clear();
        self.in_flight(Direction::Out).transfers.clear();
        info!("Released interface");
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
