//! Guest serial output port.
//!
//! A write-only sliver of a COM1 UART: bytes the guest sends with
//! `out 0x3f8, al` are forwarded to a host sink (stdout for a real VM).
//! There is no receive path and no status register; the guest is expected
//! to write blindly, which is what freestanding test kernels do.

use std::io::{self, Write};

/// COM1 data register; the only I/O port the VMM emulates.
pub const SERIAL_PORT: u16 = 0x3f8;

/// Serial output device forwarding guest bytes to a host sink.
pub struct Serial<W: Write> {
    out: W,
}

impl Serial<io::Stdout> {
    /// The standard wiring: guest serial output onto the VMM's stdout.
    pub fn stdout() -> Serial<io::Stdout> {
        Serial::new(io::stdout())
    }
}

impl<W: Write> Serial<W> {
    pub fn new(out: W) -> Serial<W> {
        Serial { out }
    }

    /// Forwards one OUT instruction's worth of bytes.
    ///
    /// Serial output is best-effort; a full or broken sink must not take
    /// the guest down.
    pub fn write_bytes(&mut self, data: &[u8]) {
        let _ = self.out.write_all(data);
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwards_bytes_to_sink() {
        let mut serial = Serial::new(Vec::new());
        serial.write_bytes(b"H");
        serial.write_bytes(b"i");
        assert_eq!(serial.out, b"Hi");
    }

    #[test]
    fn test_multi_byte_out() {
        let mut serial = Serial::new(Vec::new());
        serial.write_bytes(b"boot");
        assert_eq!(serial.out, b"boot");
    }
}
