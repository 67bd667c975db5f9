//! Primitive CPU instructions: hlt, pause, halt loop.

/// Halt the CPU until the next interrupt.
#[inline(always)]
pub fn hlt() {
    x86_64::instructions::hlt();
}

/// Spin-loop hint (PAUSE).
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

/// Mask interrupts and halt forever. NMIs still wake the core, so HLT runs
/// in a loop.
#[inline(always)]
pub fn halt_loop() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        hlt();
    }
}
