//! Minimal 16550 UART driver.
//!
//! The only output path available before the heap and the rest of the
//! logging stack exist. Every register access goes through
//! [`kestrel_core`]'s typed [`Port`] wrapper rather than raw `in`/`out`.

use kestrel_core::arch::x86_64::instructions::port::Port;

/// COM1's conventional I/O base on PC-compatible hardware.
pub const COM1: u16 = 0x3F8;

/// A 16550-compatible UART at a fixed I/O base.
///
/// Carries no state beyond the base port, so it can be constructed fresh
/// on the stack wherever it's needed (the panic path in particular must
/// not depend on any shared, lockable instance).
pub struct Uart16550 {
    data: Port<u8>,
    line_status: Port<u8>,
}

impl Uart16550 {
    /// Builds a handle for the UART at `base`. Does not touch hardware.
    pub const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            line_status: Port::new(base + 5),
        }
    }

    /// Programs the UART for 38400 8N1 with FIFOs enabled. Idempotent.
    ///
    /// # Safety
    ///
    /// `base` must name a real (or emulated) 16550 UART; this function is
    /// normally called once, early, before anything else touches the port.
    pub unsafe fn init(&self) {
        let base = self.data.port();
        // SAFETY: standard 16550 init sequence on a port range the caller
        // has promised is a real UART.
        unsafe {
            Port::<u8>::new(base + 1).write(0x00); // disable interrupts
            Port::<u8>::new(base + 3).write(0x80); // enable DLAB
            Port::<u8>::new(base + 0).write(0x03); // divisor low (38400 baud)
            Port::<u8>::new(base + 1).write(0x00); // divisor high
            Port::<u8>::new(base + 3).write(0x03); // 8N1, DLAB off
            Port::<u8>::new(base + 2).write(0xC7); // enable + clear FIFOs, 14-byte threshold
            Port::<u8>::new(base + 4).write(0x0B); // RTS/DSR set, IRQs routed out
        }
    }

    fn transmit_empty(&self) -> bool {
        // SAFETY: `line_status` is a valid UART register for any base this
        // struct was constructed with.
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    /// Writes a single byte, spinning until the transmit holding register
    /// is empty.
    pub fn write_byte(&self, byte: u8) {
        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        // SAFETY: `data` is the UART's data register; polled ready above.
        unsafe { self.data.write(byte) };
    }
}
