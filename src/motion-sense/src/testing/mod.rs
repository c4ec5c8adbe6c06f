//! Test doubles for drivers and the platform.

mod mock;

pub use mock::{IrqFrame, MockDriver, SimPort};
