//! Processor identity lookup shared by crates that sit below the APIC
//! driver.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Upper bound on logical processors tracked by the kernel.
pub const MAX_CPUS: usize = 64;

pub type LapicIdFn = fn() -> u32;

static LAPIC_ID_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Installed by the Local APIC driver once its registers are mapped.
pub fn register_lapic_id_fn(f: LapicIdFn) {
    LAPIC_ID_FN.store(f as *mut (), Ordering::Release);
}

/// APIC id of the calling processor, or 0 before the Local APIC is up
/// (only the BSP runs at that point).
pub fn current_apic_id() -> u32 {
    let ptr = LAPIC_ID_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only `LapicIdFn` values are stored by `register_lapic_id_fn`.
    let f: LapicIdFn = unsafe { core::mem::transmute::<*mut (), LapicIdFn>(ptr) };
    f()
}
