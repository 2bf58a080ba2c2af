//! Blocking command and trace capture.

use tracing::{debug, error, info, instrument, warn};

use crate::device::Radar;
use crate::error::Result;
use crate::events::{CommandPath, RadarEvent};
use crate::protocol::{Command, Gain, TRACE_ATTEMPTS, TRACE_LENGTH, TimeWindow};
use crate::state::{DeviceState, Operation};
use crate::transport::TransportError;

impl Radar {
    /// Write one command byte to the OUT endpoint.
    #[instrument(skip(self), fields(signal = %format!("0x{:02X}", signal)))]
    pub fn send_signal_sync(&self, signal: u8) -> Result<()> {
        self.require(Operation::SendSignal)?;
        let transport = self.transport()?;

        let written = transport
            .bulk_write(&[signal], self.config.signal_timeout())
            .map_err(|e| {
                error!(error = %e, "Error sending signal to device");
                e
            })?;
        if written == 0 {
            error!("Error sending signal to device");
            return Err(TransportError::WriteFailed("no bytes transferred".into()).into());
        }

        debug!(written, "Signal sent");
        if let Some(command) = Command::from_code(signal) {
            self.emit(RadarEvent::CommandIssued {
                command,
                path: CommandPath::Sync,
            });
        }
        Ok(())
    }

    /// Record and send a time window.
    pub fn set_time_window(&self, window: TimeWindow) -> Result<()> {
        self.require(Operation::SendSignal)?;
        self.update_settings(|s| s.time_window = Some(window));
        self.send_signal_sync(window.code())
    }

    /// Record and send a gain level.
    pub fn set_gain(&self, gain: Gain) -> Result<()> {
        self.require(Operation::SendSignal)?;
        self.update_settings(|s| s.gain = Some(gain));
        self.send_signal_sync(gain.code())
    }

    /// Send time window and gain twice; only the second pair must succeed.
    ///
    /// The radar ignores the first commands after power-up often enough that
    /// the pair is always repeated.
    #[instrument(skip(self))]
    pub fn start_transmission_sync(&self, window: TimeWindow, gain: Gain) -> Result<()> {
        self.require(Operation::StartTransmission)?;
        self.update_settings(|s| {
            s.time_window = Some(window);
            s.gain = Some(gain);
        });

        for code in [window.code(), gain.code()] {
            if let Err(e) = self.send_signal_sync(code) {
                warn!(error = %e, "Priming command failed");
            }
        }
        self.send_signal_sync(window.code())?;
        self.send_signal_sync(gain.code())?;

        info!(window = %window, gain = %gain, "Transmission started");
        self.advance_to(DeviceState::Transmitting);
        Ok(())
    }

    /// Read a trace into `buf` with five blocking reads.
    ///
    /// Returns [`TRACE_LENGTH`] if any read delivered a full trace, otherwise
    /// the length of the last read (0 if it failed). Reads that time out are
    /// not errors.
    #[instrument(skip(self, buf), fields(capacity = buf.len()))]
    pub fn get_current_trace(&self, buf: &mut [u8]) -> Result<usize> {
        self.require(Operation::CaptureTrace)?;
        let transport = self.transport()?;
        let timeout = self.config.trace_timeout();

        let mut last = 0;
        let mut full_trace = false;
        for attempt in 0..TRACE_ATTEMPTS {
            last = match transport.bulk_read(buf, timeout) {
                Ok(n) => n,
                Err(e) => {
                    debug!(attempt, error = %e, "Trace read failed");
                    0
                }
            };
            if last == TRACE_LENGTH {
                full_trace = true;
            }
        }

        let length = if full_trace { TRACE_LENGTH } else { last };
        self.emit(RadarEvent::TraceReceived { length });
        Ok(length)
    }
}
