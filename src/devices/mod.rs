//! Device emulation for the VMM.
//!
//! `kbc` is the hard-core legacy device: a PS/2 keyboard controller driven
//! entirely off the bus fabric in [`crate::bus`]. `cmos` and `serial` are
//! ambient devices wired directly into the I/O dispatch table so a guest
//! kernel has a console and can read a clock without timing out on boot.

mod cmos;
pub mod kbc;
mod serial;

pub use cmos::{Cmos, CMOS_PORT_DATA, CMOS_PORT_INDEX};
pub use kbc::Kbc;
pub use serial::Serial;

/// I/O port range for COM1 serial port.
pub const SERIAL_COM1_BASE: u16 = 0x3f8;
pub const SERIAL_COM1_END: u16 = 0x3ff;
