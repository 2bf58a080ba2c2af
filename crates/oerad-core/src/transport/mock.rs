//! Mock USB transport for testing.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::traits::{
    Completion, CompletionStatus, ControlRequest, DeviceCandidate, Direction, TransferToken,
    TransportError, UsbBus, UsbTransport,
};
use crate::protocol::constants::{OERAD_DEFAULT_PID, OERAD_VENDOR_ID};

/// Sleep applied by an idle `handle_events` so pump loops don't spin.
const IDLE_PUMP_SLEEP: Duration = Duration::from_millis(2);

#[derive(Default)]
struct MockState {
    connected: bool,
    /// Scripted bulk IN results, consumed in order.
    reads: VecDeque<Result<Vec<u8>, TransportError>>,
    /// Scripted bulk OUT results. Empty means "accept everything".
    write_results: VecDeque<Result<usize, TransportError>>,
    /// Captured bulk OUT writes (every attempt).
    writes: Vec<Vec<u8>>,
    controls: Vec<ControlRequest>,
    failing_controls: HashSet<u8>,
    submissions: Vec<(Direction, Vec<u8>)>,
    failing_submits: VecDeque<Direction>,
    pending: Vec<(TransferToken, Direction, Vec<u8>)>,
    cancel_requested: HashSet<TransferToken>,
    cancelled: Vec<TransferToken>,
    fail_cancel: bool,
    /// Frames delivered to pending IN transfers, one per pump.
    inbound_frames: VecDeque<Vec<u8>>,
    pump_errors: VecDeque<TransportError>,
    pump_calls: usize,
    fail_release: bool,
    releases: usize,
    next_token: u64,
}

/// Mock transport for unit testing state machine and engine logic.
pub struct MockTransport {
    state: Mutex<MockState>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_ids(OERAD_VENDOR_ID, OERAD_DEFAULT_PID)
    }

    pub fn with_ids(vid: u16, pid: u16) -> Self {
        Self {
            state: Mutex::new(MockState {
                connected: true,
                ..Default::default()
            }),
            vid,
            pid,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Queue a bulk IN response of `data`.
    pub fn queue_read(&self, data: &[u8]) {
        self.lock().reads.push_back(Ok(data.to_vec()));
    }

    /// Queue a bulk IN response of `len` zero bytes.
    pub fn queue_read_len(&self, len: usize) {
        self.lock().reads.push_back(Ok(vec![0u8; len]));
    }

    /// Queue a failing bulk IN read.
    pub fn queue_read_error(&self, err: TransportError) {
        self.lock().reads.push_back(Err(err));
    }

    /// Queue the result of the next bulk OUT write.
    pub fn queue_write_result(&self, result: Result<usize, TransportError>) {
        self.lock().write_results.push_back(result);
    }

    /// Get all captured bulk OUT writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Make every control request with this `bRequest` fail.
    pub fn fail_control(&self, request: u8) {
        self.lock().failing_controls.insert(request);
    }

    /// Get all captured control requests, failed ones included.
    pub fn get_controls(&self) -> Vec<ControlRequest> {
        self.lock().controls.clone()
    }

    /// Make the next submission in `direction` fail.
    pub fn fail_next_submit(&self, direction: Direction) {
        self.lock().failing_submits.push_back(direction);
    }

    /// Every successful asynchronous submission, in order.
    pub fn submissions(&self) -> Vec<(Direction, Vec<u8>)> {
        self.lock().submissions.clone()
    }

    /// Number of transfers currently in flight in `direction`.
    pub fn pending(&self, direction: Direction) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|(_, d, _)| *d == direction)
            .count()
    }

    /// Queue a frame for the next pending IN transfer.
    pub fn queue_inbound(&self, frame: &[u8]) {
        self.lock().inbound_frames.push_back(frame.to_vec());
    }

    /// Make the next `handle_events` call fail.
    pub fn queue_pump_error(&self, err: TransportError) {
        self.lock().pump_errors.push_back(err);
    }

    pub fn pump_calls(&self) -> usize {
        self.lock().pump_calls
    }

    /// Tokens whose cancellation was requested.
    pub fn cancelled(&self) -> Vec<TransferToken> {
        self.lock().cancelled.clone()
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.lock().fail_cancel = fail;
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.lock().fail_release = fail;
    }

    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    fn check_connected(state: &MockState) -> Result<(), TransportError> {
        if state.connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn bulk_write(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.lock();
        Self::check_connected(&state)?;
        state.writes.push(data.to_vec());
        state.write_results.pop_front().unwrap_or(Ok(data.len()))
    }

    fn bulk_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.lock();
        Self::check_connected(&state)?;
        match state.reads.pop_front() {
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn control_out(
        &self,
        request: &ControlRequest,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::check_connected(&state)?;
        state.controls.push(request.clone());
        if state.failing_controls.contains(&request.request) {
            return Err(TransportError::ControlFailed {
                request: request.request,
                message: "pipe error".into(),
            });
        }
        Ok(())
    }

    fn submit(
        &self,
        direction: Direction,
        buffer: Vec<u8>,
    ) -> Result<TransferToken, TransportError> {
        let mut state = self.lock();
        Self::check_connected(&state)?;
        if state.failing_submits.front() == Some(&direction) {
            state.failing_submits.pop_front();
            return Err(TransportError::SubmitFailed {
                direction,
                message: "no device".into(),
            });
        }
        state.next_token += 1;
        let token = TransferToken(state.next_token);
        state.submissions.push((direction, buffer.clone()));
        state.pending.push((token, direction, buffer));
        Ok(token)
    }

    fn cancel(&self, token: TransferToken) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_cancel {
            return Err(TransportError::CancelFailed {
                token,
                message: "busy".into(),
            });
        }
        state.cancelled.push(token);
        if state.pending.iter().any(|(t, _, _)| *t == token) {
            state.cancel_requested.insert(token);
        }
        Ok(())
    }

    fn handle_events(&self, timeout: Duration) -> Result<Vec<Completion>, TransportError> {
        let mut state = self.lock();
        state.pump_calls += 1;
        if let Some(err) = state.pump_errors.pop_front() {
            return Err(err);
        }

        let mut completions = Vec::new();
        let mut inbound_done = false;
        let pending = std::mem::take(&mut state.pending);
        for (token, direction, mut buffer) in pending {
            if state.cancel_requested.remove(&token) {
                completions.push(Completion {
                    token,
                    direction,
                    buffer,
                    actual_len: 0,
                    status: CompletionStatus::Cancelled,
                });
                continue;
            }
            match direction {
                Direction::Out => {
                    let actual_len = buffer.len();
                    completions.push(Completion {
                        token,
                        direction,
                        buffer,
                        actual_len,
                        status: CompletionStatus::Completed,
                    });
                }
                Direction::In if !inbound_done && !state.inbound_frames.is_empty() => {
                    inbound_done = true;
                    let frame = state.inbound_frames.pop_front().unwrap_or_default();
                    let n = frame.len().min(buffer.len());
                    buffer[..n].copy_from_slice(&frame[..n]);
                    completions.push(Completion {
                        token,
                        direction,
                        buffer,
                        actual_len: n,
                        status: CompletionStatus::Completed,
                    });
                }
                Direction::In => state.pending.push((token, direction, buffer)),
            }
        }

        if completions.is_empty() {
            drop(state);
            thread::sleep(timeout.min(IDLE_PUMP_SLEEP));
        }
        Ok(completions)
    }

    fn release(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_release {
            return Err(TransportError::ReleaseFailed {
                interface: 0,
                message: "resource busy".into(),
            });
        }
        state.releases += 1;
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Mock bus handing out one shared [`MockTransport`].
pub struct MockBus {
    devices: Mutex<Vec<DeviceCandidate>>,
    transport: Arc<MockTransport>,
    fail_open: Mutex<bool>,
    opens: Mutex<usize>,
}

impl MockBus {
    /// A bus with one default Oerad radar at address 1.
    pub fn new() -> Self {
        Self::with_devices(vec![DeviceCandidate {
            vendor_id: OERAD_VENDOR_ID,
            product_id: OERAD_DEFAULT_PID,
            address: 1,
        }])
    }

    pub fn with_devices(devices: Vec<DeviceCandidate>) -> Self {
        Self {
            devices: Mutex::new(devices),
            transport: Arc::new(MockTransport::new()),
            fail_open: Mutex::new(false),
            opens: Mutex::new(0),
        }
    }

    /// The transport every `open` returns.
    pub fn transport(&self) -> Arc<MockTransport> {
        Arc::clone(&self.transport)
    }

    /// Make `open` fail as if the interface could not be claimed.
    pub fn set_fail_open(&self, fail: bool) {
        *self.fail_open.lock().unwrap() = fail;
    }

    pub fn open_count(&self) -> usize {
        *self.opens.lock().unwrap()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBus for MockBus {
    fn devices(&self) -> Result<Vec<DeviceCandidate>, TransportError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn open(&self, candidate: &DeviceCandidate) -> Result<Arc<dyn UsbTransport>, TransportError> {
        if *self.fail_open.lock().unwrap() {
            return Err(TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: "resource busy".into(),
            });
        }
        if !self.devices.lock().unwrap().contains(candidate) {
            return Err(TransportError::DeviceNotFound {
                vid: candidate.vendor_id,
                pid: candidate.product_id,
            });
        }
        *self.opens.lock().unwrap() += 1;
        let transport: Arc<dyn UsbTransport> = self.transport.clone();
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_read_queue() {
        let mock = MockTransport::new();
        mock.queue_read_len(585);
        mock.queue_read(&[1, 2, 3]);

        let mut buf = [0u8; 1024];
        assert_eq!(mock.bulk_read(&mut buf, T).unwrap(), 585);
        assert_eq!(mock.bulk_read(&mut buf, T).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        // Queue is empty now
        assert!(matches!(
            mock.bulk_read(&mut buf, T),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.bulk_write(&[0x31], T).unwrap();
        mock.queue_write_result(Ok(0));
        assert_eq!(mock.bulk_write(&[0x32], T).unwrap(), 0);

        let writes = mock.get_writes();
        assert_eq!(writes, vec![vec![0x31], vec![0x32]]);
    }

    #[test]
    fn test_mock_async_round() {
        let mock = MockTransport::new();
        let out = mock.submit(Direction::Out, vec![0x33]).unwrap();
        let inn = mock.submit(Direction::In, vec![0u8; 600]).unwrap();
        assert_eq!(mock.pending(Direction::In), 1);

        let done = mock.handle_events(T).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, out);
        assert_eq!(mock.pending(Direction::In), 1);

        mock.queue_inbound(&[7u8; 585]);
        let done = mock.handle_events(T).unwrap();
        assert_eq!(done[0].token, inn);
        assert_eq!(done[0].data().len(), 585);
        assert_eq!(mock.pending(Direction::In), 0);
    }

    #[test]
    fn test_mock_cancel_reports_completion() {
        let mock = MockTransport::new();
        let token = mock.submit(Direction::In, vec![0u8; 600]).unwrap();
        mock.cancel(token).unwrap();
        let done = mock.handle_events(T).unwrap();
        assert_eq!(done[0].status, CompletionStatus::Cancelled);
        assert_eq!(mock.cancelled(), vec![token]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(mock.bulk_write(b"t", T).is_err());
        mock.reconnect();
        assert!(mock.bulk_write(b"t", T).is_ok());
    }

    #[test]
    fn test_mock_bus_open() {
        let bus = MockBus::new();
        let candidate = bus.devices().unwrap().remove(0);
        assert!(bus.open(&candidate).is_ok());
        bus.set_fail_open(true);
        assert!(matches!(
            bus.open(&candidate),
            Err(TransportError::ClaimInterfaceFailed { .. })
        ));
        assert_eq!(bus.open_count(), 1);
    }
}
