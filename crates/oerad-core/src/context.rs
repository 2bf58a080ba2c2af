//! Transport context: the USB bus shared by every radar.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::config::RadarConfig;
use crate::device::Radar;
use crate::error::{RadarError, Result};
use crate::events::{RadarObserver, TracingObserver};
use crate::protocol::is_supported;
use crate::transport::{DeviceCandidate, NusbBus, UsbBus};

/// Owns the bus handle. Radars discovered through a context keep the bus
/// alive on their own, so the context may be dropped first.
pub struct RadarContext {
    bus: Arc<dyn UsbBus>,
    config: RadarConfig,
    observer: Arc<dyn RadarObserver>,
}

impl RadarContext {
    pub fn new(bus: Arc<dyn UsbBus>) -> Self {
        debug!("Transport context created");
        Self {
            bus,
            config: RadarConfig::default(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// A context over the host's USB stack.
    pub fn system() -> Self {
        Self::new(Arc::new(NusbBus::new()))
    }

    /// Configuration handed to every radar created afterwards.
    pub fn with_config(mut self, config: RadarConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RadarObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &RadarConfig {
        &self.config
    }

    /// Supported devices currently on the bus.
    pub fn candidates(&self) -> Result<Vec<DeviceCandidate>> {
        let devices = self.bus.devices()?;
        Ok(devices
            .into_iter()
            .filter(|d| is_supported(d.vendor_id, d.product_id))
            .collect())
    }

    /// One radar in `OnBus` per supported device.
    #[instrument(skip(self))]
    pub fn discover(&self) -> Result<Vec<Radar>> {
        let candidates = self.candidates()?;
        if candidates.is_empty() {
            info!("No valid Oerad devices found");
            return Err(RadarError::NoDevices);
        }

        info!(count = candidates.len(), "Found Oerad devices");
        Ok(candidates
            .into_iter()
            .map(|candidate| {
                debug!(device = %candidate, "Radar on bus");
                Radar::new(candidate, Arc::clone(&self.bus), self.config.clone())
                    .with_observer(Arc::clone(&self.observer))
            })
            .collect())
    }

    /// A radar bound to no device, in `NoDevice`.
    pub fn unbound_radar(&self) -> Radar {
        Radar::unbound(Arc::clone(&self.bus), self.config.clone())
            .with_observer(Arc::clone(&self.observer))
    }
}

impl Drop for RadarContext {
    fn drop(&mut self) {
        debug!("Transport context released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{OERAD_PID_8AA0, OERAD_VENDOR_ID};
    use crate::state::DeviceState;
    use crate::transport::MockBus;

    #[test]
    fn test_discover_filters_unsupported() {
        let bus = MockBus::with_devices(vec![
            DeviceCandidate {
                vendor_id: OERAD_VENDOR_ID,
                product_id: OERAD_PID_8AA0,
                address: 4,
            },
            DeviceCandidate {
                vendor_id: 0x8086,
                product_id: 0xE005,
                address: 5,
            },
        ]);
        let ctx = RadarContext::new(Arc::new(bus));
        let radars = ctx.discover().unwrap();
        assert_eq!(radars.len(), 1);
        assert_eq!(radars[0].state(), DeviceState::OnBus);
        assert_eq!(radars[0].candidate().map(|c| c.address), Some(4));
    }

    #[test]
    fn test_discover_empty_bus() {
        let ctx = RadarContext::new(Arc::new(MockBus::with_devices(Vec::new())));
        assert!(matches!(ctx.discover(), Err(RadarError::NoDevices)));
        assert_eq!(ctx.unbound_radar().state(), DeviceState::NoDevice);
    }

    #[test]
    fn test_radar_outlives_context() {
        let ctx = RadarContext::new(Arc::new(MockBus::new()));
        let radars = ctx.discover().unwrap();
        drop(ctx);
        radars[0].connect().unwrap();
        assert_eq!(radars[0].state(), DeviceState::Connected);
    }
}
