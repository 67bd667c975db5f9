//! CPUID queries used by the APIC drivers.

use core::arch::x86_64::{CpuidResult, __cpuid};

pub const CPUID_LEAF_FEATURES: u32 = 0x01;

/// EDX bit 9 of the feature leaf: on-chip Local APIC.
pub const CPUID_FEAT_EDX_APIC: u32 = 1 << 9;

#[inline]
#[allow(unused_unsafe)]
pub fn cpuid(leaf: u32) -> CpuidResult {
    // SAFETY: CPUID exists on every x86_64 processor.
    unsafe { __cpuid(leaf) }
}

pub fn has_local_apic() -> bool {
    cpuid(CPUID_LEAF_FEATURES).edx & CPUID_FEAT_EDX_APIC != 0
}
