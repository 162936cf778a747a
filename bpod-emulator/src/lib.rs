#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Host-side emulator for the state machine client.
//!
//! [`device::VirtualDevice`] answers the serial protocol from memory so the
//! whole compile, run and reconstruct pipeline can be exercised without a
//! board attached.

pub mod demos;
pub mod device;
pub mod grammar;
pub mod session;

pub use device::{RunLimits, Stimulus, VirtualDevice};
pub use session::Session;
