//! Model-Specific Register access and the IA32_APIC_BASE layout.

use x86_64::registers::model_specific::Msr;

pub const MSR_APIC_BASE: u32 = 0x1B;

/// Bit layout of IA32_APIC_BASE.
pub struct ApicBaseMsr;

impl ApicBaseMsr {
    /// Set on the bootstrap processor.
    pub const BSP: u64 = 1 << 8;
    /// x2APIC mode enable.
    pub const X2APIC_ENABLE: u64 = 1 << 10;
    /// xAPIC global enable.
    pub const GLOBAL_ENABLE: u64 = 1 << 11;
    /// Physical base of the register page.
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
}

#[inline(always)]
pub fn read_msr(msr: u32) -> u64 {
    // SAFETY: callers only pass architectural MSR numbers present on every
    // long-mode CPU with an APIC.
    unsafe { Msr::new(msr).read() }
}

#[inline(always)]
pub fn write_msr(msr: u32, value: u64) {
    let mut reg = Msr::new(msr);
    // SAFETY: as for `read_msr`; the written values keep reserved bits as
    // read.
    unsafe { reg.write(value) }
}
