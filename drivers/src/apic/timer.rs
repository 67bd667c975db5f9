//! LAPIC timer calibration and periodic mode.
//!
//! The LAPIC timer counts down at the bus clock divided by 16, which varies
//! per machine, so it is measured once against the PIT before the periodic
//! tick is armed.

use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_lib::{klog_debug, klog_info};
use kestrel_mm::RegisterBus;

use super::regs::*;
use super::{LocalApic, lapic};

// ---------------------------------------------------------------------------
// Static state
// ---------------------------------------------------------------------------

/// Calibrated LAPIC timer frequency in Hz (divisor 16).
static LAPIC_TIMER_FREQ_HZ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Calibration tunables
// ---------------------------------------------------------------------------

const CALIBRATION_SAMPLES: u32 = 3;
const CALIBRATION_WINDOW_MS: u32 = 10;

const MIN_REASONABLE_FREQ_HZ: u64 = 1_000_000;
const MAX_REASONABLE_FREQ_HZ: u64 = 10_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerError {
    /// No Local APIC has been brought up.
    NoApic,
    NotCalibrated,
    /// The counter did not move during the reference window.
    CounterStalled,
    InvalidFrequency(u32),
    /// The initial count for the requested rate does not fit 32 bits.
    CountOutOfRange(u64),
}

// ---------------------------------------------------------------------------
// Register-level operations
// ---------------------------------------------------------------------------

impl<R: RegisterBus> LocalApic<R> {
    /// Measure the timer rate, averaging several windows timed by
    /// `delay_ms`.
    pub fn timer_measure(&self, mut delay_ms: impl FnMut(u32)) -> Result<u64, TimerError> {
        let mut total_elapsed: u64 = 0;

        for _ in 0..CALIBRATION_SAMPLES {
            // One-shot and masked: nothing fires while measuring.
            self.write(LAPIC_LVT_TIMER, LAPIC_TIMER_ONESHOT | LAPIC_LVT_MASKED);
            self.write(LAPIC_TIMER_DCR, LAPIC_TIMER_DIV_16);
            self.write(LAPIC_TIMER_ICR, u32::MAX);

            delay_ms(CALIBRATION_WINDOW_MS);

            let elapsed = u32::MAX.wrapping_sub(self.timer_current_count());
            self.write(LAPIC_TIMER_ICR, 0);
            total_elapsed += elapsed as u64;
        }

        let avg_elapsed = total_elapsed / CALIBRATION_SAMPLES as u64;
        if avg_elapsed == 0 {
            return Err(TimerError::CounterStalled);
        }
        Ok(avg_elapsed * 1000 / CALIBRATION_WINDOW_MS as u64)
    }

    /// Arm the timer to fire `vector` at `hz` given the measured rate.
    /// Returns the initial count.
    pub fn timer_program_periodic(
        &self,
        vector: u8,
        hz: u32,
        timer_freq: u64,
    ) -> Result<u32, TimerError> {
        if timer_freq == 0 {
            return Err(TimerError::NotCalibrated);
        }
        if hz == 0 {
            return Err(TimerError::InvalidFrequency(hz));
        }
        let count = timer_freq / hz as u64;
        if count == 0 || count > u32::MAX as u64 {
            return Err(TimerError::CountOutOfRange(count));
        }

        self.write(LAPIC_TIMER_DCR, LAPIC_TIMER_DIV_16);
        self.write(LAPIC_LVT_TIMER, vector as u32 | LAPIC_TIMER_PERIODIC);
        self.write(LAPIC_TIMER_ICR, count as u32);
        Ok(count as u32)
    }

    pub fn timer_stop(&self) {
        self.write(LAPIC_LVT_TIMER, LAPIC_LVT_MASKED);
        self.write(LAPIC_TIMER_ICR, 0);
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Calibrate the boot processor's timer against the PIT and remember the
/// result for every processor.
pub fn timer_calibrate() -> Result<u64, TimerError> {
    let apic = lapic().ok_or(TimerError::NoApic)?;
    let freq = apic.timer_measure(crate::pit::pit_poll_delay_ms)?;

    if !(MIN_REASONABLE_FREQ_HZ..=MAX_REASONABLE_FREQ_HZ).contains(&freq) {
        klog_info!(
            "APIC TIMER: WARNING - {} Hz outside expected range [{}, {}]",
            freq,
            MIN_REASONABLE_FREQ_HZ,
            MAX_REASONABLE_FREQ_HZ,
        );
    }

    LAPIC_TIMER_FREQ_HZ.store(freq, Ordering::Release);
    klog_info!(
        "APIC TIMER: Calibrated at {}.{:03} MHz ({} Hz, div 16, via PIT)",
        freq / 1_000_000,
        (freq % 1_000_000) / 1_000,
        freq,
    );
    Ok(freq)
}

/// Start the calling processor's periodic tick.
pub fn timer_start_periodic(vector: u8, hz: u32) -> Result<(), TimerError> {
    let apic = lapic().ok_or(TimerError::NoApic)?;
    let count = apic.timer_program_periodic(vector, hz, frequency_hz())?;
    klog_debug!(
        "APIC TIMER: Periodic mode - vector 0x{:x}, {} Hz, count {}",
        vector,
        hz,
        count,
    );
    Ok(())
}

#[inline]
pub fn frequency_hz() -> u64 {
    LAPIC_TIMER_FREQ_HZ.load(Ordering::Acquire)
}

#[inline]
pub fn is_calibrated() -> bool {
    frequency_hz() != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRegisters;

    #[test]
    fn measurement_averages_the_windows() {
        let apic = LocalApic::new(FakeRegisters::new(), 0);
        let mut windows = 0;
        let freq = apic
            .timer_measure(|ms| {
                assert_eq!(ms, CALIBRATION_WINDOW_MS);
                windows += 1;
                // 62_500 ticks in 10 ms.
                apic.regs().set(LAPIC_TIMER_CCR, u32::MAX - 62_500);
            })
            .unwrap();
        assert_eq!(windows, CALIBRATION_SAMPLES);
        assert_eq!(freq, 6_250_000);
        assert_eq!(apic.regs().get(LAPIC_TIMER_ICR), 0);
    }

    #[test]
    fn stalled_counter_is_an_error() {
        let apic = LocalApic::new(FakeRegisters::new(), 0);
        let result = apic.timer_measure(|_| apic.regs().set(LAPIC_TIMER_CCR, u32::MAX));
        assert_eq!(result, Err(TimerError::CounterStalled));
    }

    #[test]
    fn periodic_programming() {
        let apic = LocalApic::new(FakeRegisters::new(), 0);
        assert_eq!(apic.timer_program_periodic(0x20, 100, 6_250_000), Ok(62_500));
        assert_eq!(apic.regs().get(LAPIC_LVT_TIMER), 0x20 | LAPIC_TIMER_PERIODIC);
        assert_eq!(apic.regs().get(LAPIC_TIMER_DCR), LAPIC_TIMER_DIV_16);
        assert_eq!(apic.regs().get(LAPIC_TIMER_ICR), 62_500);

        assert_eq!(
            apic.timer_program_periodic(0x20, 100, 0),
            Err(TimerError::NotCalibrated)
        );
        assert_eq!(
            apic.timer_program_periodic(0x20, 0, 6_250_000),
            Err(TimerError::InvalidFrequency(0))
        );
        assert_eq!(
            apic.timer_program_periodic(0x20, 10_000, 5_000),
            Err(TimerError::CountOutOfRange(0))
        );
    }
}
