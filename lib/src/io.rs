//! Port I/O seam.
//!
//! Drivers talk to legacy ISA devices (8259 PIC, 8254 PIT) through
//! [`PortBus`] so their sequencing can be exercised against a recording bus.
//! [`HwPorts`] is the real implementation on top of `x86_64`'s `Port`.

use x86_64::instructions::port::Port;

/// Unused POST diagnostic port; a write here costs roughly one microsecond.
pub const IO_DELAY_PORT: u16 = 0x80;

pub trait PortBus {
    fn read8(&self, port: u16) -> u8;
    fn write8(&self, port: u16, value: u8);

    /// Give slow ISA devices time to latch the previous command.
    #[inline]
    fn io_wait(&self) {
        self.write8(IO_DELAY_PORT, 0);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HwPorts;

impl PortBus for HwPorts {
    #[inline]
    fn read8(&self, port: u16) -> u8 {
        let mut p: Port<u8> = Port::new(port);
        // SAFETY: only driver-owned legacy ports are passed in.
        unsafe { p.read() }
    }

    #[inline]
    fn write8(&self, port: u16, value: u8) {
        let mut p: Port<u8> = Port::new(port);
        // SAFETY: only driver-owned legacy ports are passed in.
        unsafe { p.write(value) }
    }
}
