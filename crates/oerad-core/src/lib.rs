//! Oerad-Core: host-side driver for Oerad ground-penetrating radars.
//!
//! The radar sits behind a CP210x USB-to-UART bridge. The host configures
//! the bridge, writes single-byte commands (time window, gain) and reads
//! fixed-size traces back.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command codes, endpoint constants, bridge setup sequence
//! - **Transport**: USB bus abstraction (nusb, mock)
//! - **State**: Ordered lifecycle states and per-operation gates
//! - **Device**: The `Radar` handle and its lifecycle
//! - **Sync**: Blocking commands and trace capture
//! - **Engine**: Asynchronous transfers, event pump, completion handlers
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use oerad_core::{Gain, RadarContext, TimeWindow, TRACE_LENGTH};
//!
//! let ctx = RadarContext::system();
//! let radars = ctx.discover().expect("no radar");
//! let radar = &radars[0];
//!
//! radar.connect().expect("connect failed");
//! radar.initialize().expect("setup failed");
//! radar
//!     .start_transmission_sync(TimeWindow::Short, Gain::Level2)
//!     .expect("radar did not start");
//!
//! let mut trace = vec![0u8; 600];
//! let n = radar.get_current_trace(&mut trace).expect("read failed");
//! assert!(n <= TRACE_LENGTH);
//! radar.disconnect().expect("disconnect failed");
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod state;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::{PendingPolicy, RadarConfig};
pub use context::RadarContext;
pub use device::{Radar, Settings};
pub use engine::TransferHandler;
pub use error::{RadarError, Result};
pub use events::{CommandPath, NullObserver, RadarEvent, RadarObserver, TracingObserver};
pub use protocol::{Command, Gain, MIN_BUFFER_IN_SIZE, TRACE_LENGTH, TimeWindow};
pub use state::{DeviceState, Operation};
pub use transport::{
    DeviceCandidate, MockBus, MockTransport, NusbBus, TransportError, UsbBus, UsbTransport,
};
