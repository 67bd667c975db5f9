//! Interrupt flag management.

use x86_64::instructions::interrupts;

pub use x86_64::instructions::interrupts::without_interrupts;

/// Enable interrupts (STI).
#[inline(always)]
pub fn enable_interrupts() {
    interrupts::enable();
}

/// Disable interrupts (CLI).
#[inline(always)]
pub fn disable_interrupts() {
    interrupts::disable();
}

/// Returns true if interrupts are currently enabled (IF bit set).
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}
