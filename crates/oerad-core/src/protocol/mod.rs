//! Protocol module - Oerad command codes and bridge setup.

pub mod command;
pub mod constants;
pub mod setup;

pub use command::{Command, Gain, TimeWindow};
pub use constants::*;
pub use setup::{SetupStep, setup_sequence};
