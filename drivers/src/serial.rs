//! COM1 console and the klog backend on top of it.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use uart_16550::SerialPort;

use kestrel_lib::cpu::interrupts::without_interrupts;
use kestrel_lib::klog_register_backend;

pub const COM1_BASE: u16 = 0x3F8;

/// Taken with interrupts disabled only, so a handler that logs can never
/// spin on a lock its own CPU holds.
// SAFETY: COM1 is the standard first serial port and nothing else drives it.
static COM1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_BASE) });
static READY: AtomicBool = AtomicBool::new(false);

/// Program the UART and route klog output to it.
pub fn init() {
    without_interrupts(|| COM1.lock().init());
    READY.store(true, Ordering::Release);
    klog_register_backend(serial_klog_backend);
}

pub fn is_ready() -> bool {
    READY.load(Ordering::Acquire)
}

fn serial_klog_backend(args: fmt::Arguments<'_>) {
    without_interrupts(|| {
        let mut port = COM1.lock();
        let _ = port.write_fmt(args);
        let _ = port.write_str("\n");
    });
}

pub fn write_str(s: &str) {
    without_interrupts(|| {
        let _ = COM1.lock().write_str(s);
    });
}

pub fn print_args(args: fmt::Arguments<'_>) {
    without_interrupts(|| {
        let _ = COM1.lock().write_fmt(args);
    });
}
