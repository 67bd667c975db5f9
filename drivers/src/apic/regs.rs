//! Local APIC MMIO register offsets and control flags.
//!
//! Device-level definitions for programming the xAPIC page. The
//! IA32_APIC_BASE MSR layout lives in `kestrel_lib::cpu::msr`.

use bitflags::bitflags;

// =============================================================================
// Register Offsets
// =============================================================================

pub(crate) const LAPIC_REGION_SIZE: usize = 0x1000;

pub(crate) const LAPIC_ID: usize = 0x020;
pub(crate) const LAPIC_VERSION: usize = 0x030;
pub(crate) const LAPIC_TPR: usize = 0x080;
pub(crate) const LAPIC_EOI: usize = 0x0B0;
pub(crate) const LAPIC_LDR: usize = 0x0D0;
pub(crate) const LAPIC_DFR: usize = 0x0E0;
pub(crate) const LAPIC_SPURIOUS: usize = 0x0F0;
pub(crate) const LAPIC_ISR_BASE: usize = 0x100;
pub(crate) const LAPIC_ESR: usize = 0x280;
pub(crate) const LAPIC_ICR_LOW: usize = 0x300;
pub(crate) const LAPIC_ICR_HIGH: usize = 0x310;
pub(crate) const LAPIC_LVT_TIMER: usize = 0x320;
pub(crate) const LAPIC_LVT_PERFCNT: usize = 0x340;
pub(crate) const LAPIC_LVT_LINT0: usize = 0x350;
pub(crate) const LAPIC_LVT_LINT1: usize = 0x360;
pub(crate) const LAPIC_LVT_ERROR: usize = 0x370;
pub(crate) const LAPIC_TIMER_ICR: usize = 0x380;
pub(crate) const LAPIC_TIMER_CCR: usize = 0x390;
pub(crate) const LAPIC_TIMER_DCR: usize = 0x3E0;

/// In-service register words, 32 vectors each.
pub(crate) const LAPIC_ISR_WORDS: usize = 8;

#[inline]
pub(crate) const fn isr_word(index: usize) -> usize {
    LAPIC_ISR_BASE + index * 0x10
}

// =============================================================================
// Control Flags
// =============================================================================

pub const LAPIC_SPURIOUS_VECTOR: u8 = 0xFF;
pub(crate) const LAPIC_SPURIOUS_ENABLE: u32 = 1 << 8;
pub(crate) const LAPIC_LVT_MASKED: u32 = 1 << 16;
pub(crate) const LAPIC_LVT_DELIVERY_NMI: u32 = 0x4 << 8;
pub(crate) const LAPIC_LVT_DELIVERY_EXTINT: u32 = 0x7 << 8;
pub(crate) const LAPIC_DFR_FLAT: u32 = 0xFFFF_FFFF;
pub(crate) const LAPIC_LDR_SHIFT: u32 = 24;

// =============================================================================
// Timer Configuration
// =============================================================================

pub(crate) const LAPIC_TIMER_ONESHOT: u32 = 0;
pub(crate) const LAPIC_TIMER_PERIODIC: u32 = 0x0002_0000;
pub(crate) const LAPIC_TIMER_DIV_16: u32 = 0x3;

// =============================================================================
// Interrupt Command Register
// =============================================================================

const ICR_DESTINATION_SHIFT: u32 = 24;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcrDelivery {
    Fixed = 0 << 8,
    Nmi = 4 << 8,
    Init = 5 << 8,
    Startup = 6 << 8,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IcrFlags: u32 {
        const DEST_LOGICAL = 1 << 11;
        /// Read-only: the previous command has not been accepted yet.
        const DELIVERY_PENDING = 1 << 12;
        const LEVEL_ASSERT = 1 << 14;
        const TRIGGER_LEVEL = 1 << 15;
    }
}

/// One inter-processor interrupt, as the two ICR halves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcrCommand {
    low: u32,
    high: u32,
}

impl IcrCommand {
    pub const fn new(destination: u8, delivery: IcrDelivery, vector: u8, flags: IcrFlags) -> Self {
        Self {
            low: vector as u32 | delivery as u32 | flags.bits(),
            high: (destination as u32) << ICR_DESTINATION_SHIFT,
        }
    }

    /// INIT, level assert, physical destination.
    pub const fn init(destination: u8) -> Self {
        Self::new(destination, IcrDelivery::Init, 0, IcrFlags::LEVEL_ASSERT)
    }

    /// STARTUP: the target begins executing at `page << 12` in real mode.
    pub const fn startup(destination: u8, page: u8) -> Self {
        Self::new(destination, IcrDelivery::Startup, page, IcrFlags::LEVEL_ASSERT)
    }

    pub const fn fixed(destination: u8, vector: u8) -> Self {
        Self::new(destination, IcrDelivery::Fixed, vector, IcrFlags::LEVEL_ASSERT)
    }

    pub const fn low(self) -> u32 {
        self.low
    }

    pub const fn high(self) -> u32 {
        self.high
    }

    pub const fn destination(self) -> u8 {
        (self.high >> ICR_DESTINATION_SHIFT) as u8
    }

    pub const fn vector(self) -> u8 {
        self.low as u8
    }
}
