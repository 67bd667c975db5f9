//! System tick: counter, scheduler hook and the IRQ handler that drives
//! both from whichever periodic source the boot path programmed.

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use kestrel_lib::InterruptFrame;

use crate::irq::{IrqHandler, IrqReturn};
use crate::smp::current_cpu_index;

pub type TickHook = fn(u64);

/// Processor whose timer advances the global count. Every processor arms
/// its own Local APIC timer, so the others must not count.
pub const TICK_CPU: usize = 0;

static TICKS: AtomicU64 = AtomicU64::new(0);
static TICK_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Called on every tick with the new tick count. The scheduler's only
/// entry from the interrupt core.
pub fn set_tick_hook(hook: TickHook) {
    TICK_HOOK.store(hook as *mut (), Ordering::Release);
}

pub fn clear_tick_hook() {
    TICK_HOOK.store(core::ptr::null_mut(), Ordering::Release);
}

#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the tick count and run the hook.
pub fn timer_tick() -> u64 {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    let hook = TICK_HOOK.load(Ordering::Acquire);
    if !hook.is_null() {
        // SAFETY: only `TickHook` values are stored by `set_tick_hook`.
        let hook: TickHook = unsafe { core::mem::transmute::<*mut (), TickHook>(hook) };
        hook(now);
    }
    now
}

/// Tick handler installed on the timer line.
pub struct TimerTick {
    hz: AtomicU32,
    cpu: fn() -> usize,
}

impl TimerTick {
    pub const fn new(hz: u32) -> Self {
        Self::with_cpu_source(hz, current_cpu_index)
    }

    /// `cpu` names the processor taking the interrupt.
    pub const fn with_cpu_source(hz: u32, cpu: fn() -> usize) -> Self {
        Self {
            hz: AtomicU32::new(hz),
            cpu,
        }
    }

    pub fn frequency(&self) -> u32 {
        self.hz.load(Ordering::Relaxed)
    }

    pub fn set_frequency(&self, hz: u32) {
        self.hz.store(hz, Ordering::Relaxed);
    }

    /// Milliseconds represented by `ticks` at this frequency.
    pub fn ticks_to_ms(&self, ticks: u64) -> u64 {
        match self.frequency() {
            0 => 0,
            hz => ticks * 1000 / hz as u64,
        }
    }
}

impl IrqHandler for TimerTick {
    fn handle(&self, _irq: u8, _frame: &mut InterruptFrame) -> IrqReturn {
        if (self.cpu)() == TICK_CPU {
            timer_tick();
        }
        IrqReturn::Handled
    }

    fn name(&self) -> &'static str {
        "timer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    static SEEN: StdAtomicU64 = StdAtomicU64::new(0);

    fn record(now: u64) {
        SEEN.store(now, Ordering::SeqCst);
    }

    // Single test touching the global counter so parallel tests cannot race.
    #[test]
    fn only_the_boot_processor_advances_the_tick() {
        let before = ticks();
        set_tick_hook(record);
        let bsp = TimerTick::with_cpu_source(100, || 0);
        let ap = TimerTick::with_cpu_source(100, || 1);
        let mut frame = InterruptFrame::for_vector(0x20, 0);

        assert_eq!(bsp.handle(0, &mut frame), IrqReturn::Handled);
        assert_eq!(ticks(), before + 1);
        assert_eq!(SEEN.load(Ordering::SeqCst), before + 1);

        for _ in 0..3 {
            assert_eq!(ap.handle(0, &mut frame), IrqReturn::Handled);
        }
        assert_eq!(ticks(), before + 1);
        assert_eq!(SEEN.load(Ordering::SeqCst), before + 1);

        assert_eq!(bsp.handle(0, &mut frame), IrqReturn::Handled);
        assert_eq!(ap.handle(0, &mut frame), IrqReturn::Handled);
        assert_eq!(ticks(), before + 2);

        clear_tick_hook();
        timer_tick();
        assert_eq!(SEEN.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn converts_ticks_to_milliseconds() {
        let t = TimerTick::new(250);
        assert_eq!(t.ticks_to_ms(500), 2000);
        t.set_frequency(0);
        assert_eq!(t.ticks_to_ms(500), 0);
    }
}
