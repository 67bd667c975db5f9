//! Intel 8254 PIT: polled delay for LAPIC calibration, and the periodic
//! tick on IRQ 0 when the kernel falls back to the 8259 pair.

use kestrel_lib::cpu::interrupts::without_interrupts;
use kestrel_lib::{HwPorts, PortBus, klog_debug};

pub const PIT_BASE_FREQUENCY_HZ: u32 = 1_193_182;
pub const PIT_CHANNEL0: u16 = 0x40;
pub const PIT_COMMAND: u16 = 0x43;

/// Counter wraps at 0x10000; a programmed divisor of 0 means this value.
const DEFAULT_RELOAD: u32 = 0x10000;

const CMD_LATCH_CHANNEL0: u8 = 0x00;
/// Channel 0, lobyte/hibyte, mode 3 (square wave), binary.
const CMD_CHANNEL0_SQUARE_WAVE: u8 = 0x36;

pub struct Pit<P: PortBus> {
    ports: P,
}

impl<P: PortBus> Pit<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    /// Latch and read the channel 0 down-counter.
    pub fn read_count(&self) -> u16 {
        self.ports.write8(PIT_COMMAND, CMD_LATCH_CHANNEL0);
        let low = self.ports.read8(PIT_CHANNEL0);
        let high = self.ports.read8(PIT_CHANNEL0);
        ((high as u16) << 8) | low as u16
    }

    /// Spin for `ms` milliseconds on the free-running counter. Needs no
    /// prior programming: the counter runs from power-on.
    pub fn poll_delay_ms(&self, ms: u32) {
        if ms == 0 {
            return;
        }

        let ticks_needed = (ms as u64 * PIT_BASE_FREQUENCY_HZ as u64 / 1000) as u32;
        let mut last = self.read_count();
        let mut elapsed: u32 = 0;

        while elapsed < ticks_needed {
            core::hint::spin_loop();

            let current = self.read_count();
            let step = if current <= last {
                (last - current) as u32
            } else {
                last as u32 + DEFAULT_RELOAD - current as u32
            };
            elapsed = elapsed.saturating_add(step);
            last = current;
        }
    }

    /// Program channel 0 in square-wave mode at roughly `hz`.
    ///
    /// Returns the frequency actually produced by the integer divisor.
    pub fn set_frequency(&self, hz: u32) -> u32 {
        let divisor = (PIT_BASE_FREQUENCY_HZ / hz.max(1)).clamp(1, DEFAULT_RELOAD);
        // 0x10000 is written as 0.
        let raw = (divisor & 0xFFFF) as u16;
        self.ports.write8(PIT_COMMAND, CMD_CHANNEL0_SQUARE_WAVE);
        self.ports.write8(PIT_CHANNEL0, raw as u8);
        self.ports.write8(PIT_CHANNEL0, (raw >> 8) as u8);

        let actual = PIT_BASE_FREQUENCY_HZ / divisor;
        klog_debug!("PIT: Channel 0 at {} Hz (divisor {})", actual, divisor);
        actual
    }
}

static PIT: Pit<HwPorts> = Pit::new(HwPorts);

/// Polled delay on the hardware PIT with interrupts held off, so the
/// two-byte counter reads are never split.
pub fn pit_poll_delay_ms(ms: u32) {
    without_interrupts(|| PIT.poll_delay_ms(ms));
}

pub fn pit_set_frequency(hz: u32) -> u32 {
    PIT.set_frequency(hz)
}
