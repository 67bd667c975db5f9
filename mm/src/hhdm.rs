//! Higher Half Direct Map (HHDM) translation.
//!
//! The bootloader maps all physical memory at a fixed virtual offset. This
//! module stores that offset once and translates through it.

use kestrel_lib::{InitOnce, kfatal};
use x86_64::{PhysAddr, VirtAddr};

static HHDM_OFFSET: InitOnce<u64> = InitOnce::new();

/// Record the direct-map offset. Called exactly once during early boot.
pub fn init(offset: u64) {
    if HHDM_OFFSET.init(|| offset).is_err() {
        kfatal!("HHDM already initialized - init() called twice");
    }
}

#[inline]
pub fn is_available() -> bool {
    HHDM_OFFSET.is_ready()
}

#[inline]
pub fn try_offset() -> Option<u64> {
    HHDM_OFFSET.get().copied()
}

/// Translate through an explicit offset; `None` on overflow or a
/// non-canonical result.
#[inline]
pub fn translate(offset: u64, phys: PhysAddr) -> Option<VirtAddr> {
    let virt = phys.as_u64().checked_add(offset)?;
    VirtAddr::try_new(virt).ok()
}

#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> Option<VirtAddr> {
    translate(try_offset()?, phys)
}
