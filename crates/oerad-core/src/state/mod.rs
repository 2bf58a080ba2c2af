//! State machine module.

pub mod machine;

pub use machine::{AtomicState, DeviceState, Operation};
