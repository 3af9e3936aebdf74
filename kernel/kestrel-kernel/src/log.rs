//! Kernel logging bring-up.
//!
//! Two phases, matching [`kestrel_core::log`]'s print/log function slots:
//!
//! **Phase 1 — early serial.** [`init_early`] points `kestrel_core`'s raw
//! print/log functions straight at COM1 with no lock and no allocation, so
//! everything from GDT init through heap bring-up has somewhere to go.
//!
//! **Phase 2 — full logger.** [`init`] installs a [`Logger`] fanning out to
//! a `Vec<Box<dyn LogSink>>` behind a spin lock, and hands the same slots
//! to it. [`add_sink`] registers further sinks (a framebuffer console, say)
//! once the devices backing them exist.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use kestrel_core::log::LogLevel;
use kestrel_core::sync::SpinLock;

use crate::serial::{COM1, Uart16550};

/// An output sink for the full logger. `&self` because every sink this
/// crate ships (serial) is stateless port I/O; a sink needing interior
/// mutability would hold its own lock.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment to this sink.
    fn write_str(&self, s: &str);
    /// Highest level this sink accepts (messages with `level <= max_level`
    /// reach it).
    fn max_level(&self) -> LogLevel;
}

/// A [`LogSink`] writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl SerialSink {
    /// Builds a sink over `uart`, accepting messages up to `max_level`.
    pub const fn new(uart: Uart16550, max_level: LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.uart.write_byte(b'\r');
            }
            self.uart.write_byte(byte);
        }
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }
}

struct SerialWriter(Uart16550);

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

fn early_print(args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = w.write_fmt(args);
}

fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(w, "[{}] {args}\n", level.name());
}

/// Programs COM1 and registers the early, lock-free print/log functions.
///
/// # Safety
///
/// Must run before anything calls `kprint!`/`klog!`, and at most once per
/// boot (programming the UART twice is harmless but pointless).
pub unsafe fn init_early() {
    let uart = Uart16550::new(COM1);
    // SAFETY: COM1 is the standard PC serial port; this runs once, early.
    unsafe { uart.init() };
    // SAFETY: both functions are plain stack-only code, safe from any
    // context.
    unsafe {
        kestrel_core::log::set_print_fn(early_print);
        kestrel_core::log::set_log_fn(early_log);
    }
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

struct Logger {
    sinks: SpinLock<Vec<Box<dyn LogSink>>>,
}

impl Logger {
    const fn new() -> Self {
        Self { sinks: SpinLock::new(Vec::new()) }
    }

    fn print(&self, args: fmt::Arguments<'_>) {
        for sink in self.sinks.lock().iter() {
            let mut w = SinkWriter(sink.as_ref());
            let _ = fmt::Write::write_fmt(&mut w, args);
        }
    }

    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        for sink in self.sinks.lock().iter() {
            if level <= sink.max_level() {
                let mut w = SinkWriter(sink.as_ref());
                let _ = write!(w, "[{}] {args}\n", level.name());
            }
        }
    }
}

static LOGGER: Logger = Logger::new();

fn logger_print(args: fmt::Arguments<'_>) {
    LOGGER.print(args);
}

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    LOGGER.log(level, args);
}

/// Initializes the full logger with a serial sink and switches
/// `kestrel_core`'s print/log slots over to it. Call once the heap is up.
pub fn init() {
    LOGGER.sinks.lock().push(Box::new(SerialSink::new(Uart16550::new(COM1), crate::config::MAX_LOG_LEVEL)));
    // SAFETY: both functions are safe from any context; the sink vector is
    // already populated above.
    unsafe {
        kestrel_core::log::set_print_fn(logger_print);
        kestrel_core::log::set_log_fn(logger_log);
    }
}

/// Registers an additional output sink with the full logger.
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.sinks.lock().push(sink);
}

/// Writes a panic message directly to COM1, bypassing the logger and its
/// lock entirely — safe to call even if the logger's spin lock is held by
/// the panicking CPU.
pub fn panic_serial(info: &core::panic::PanicInfo) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(w, "\n!!! KERNEL PANIC !!!\n{info}\n");
}
