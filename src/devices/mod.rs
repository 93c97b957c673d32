//! Device emulation for the VMM.
//!
//! The only device the guest gets is a serial output port; everything else
//! it touches ends the VM.

mod serial;

pub use serial::{Serial, SERIAL_PORT};
