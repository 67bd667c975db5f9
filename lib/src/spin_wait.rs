//! Bounded polling.
//!
//! Every wait on hardware state (ICR delivery status, AP readiness, PIT
//! calibration) goes through a [`SpinPolicy`] so the retry budget is named
//! once and expiry is an ordinary error value.

/// Returned when the condition did not become true within the budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpinTimeout {
    pub polls: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpinPolicy {
    max_polls: u32,
}

impl SpinPolicy {
    /// Local APIC delivery-status bit.
    pub const IPI_DELIVERY: Self = Self::new(100_000);
    /// AP self-reported readiness after STARTUP.
    pub const AP_STARTUP: Self = Self::new(2_000_000);

    pub const fn new(max_polls: u32) -> Self {
        Self { max_polls }
    }

    pub const fn max_polls(&self) -> u32 {
        self.max_polls
    }

    /// Poll `cond` with a PAUSE between attempts.
    ///
    /// Returns the number of relax steps taken before the condition held.
    #[inline]
    pub fn wait_until(&self, cond: impl FnMut() -> bool) -> Result<u32, SpinTimeout> {
        self.wait_until_relax(cond, core::hint::spin_loop)
    }

    /// Poll `cond`, calling `relax` between attempts.
    pub fn wait_until_relax(
        &self,
        mut cond: impl FnMut() -> bool,
        mut relax: impl FnMut(),
    ) -> Result<u32, SpinTimeout> {
        for polls in 0..self.max_polls {
            if cond() {
                return Ok(polls);
            }
            relax();
        }
        if cond() {
            Ok(self.max_polls)
        } else {
            Err(SpinTimeout {
                polls: self.max_polls,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_already_true_costs_nothing() {
        let mut relaxed = 0;
        let res = SpinPolicy::new(10).wait_until_relax(|| true, || relaxed += 1);
        assert_eq!(res, Ok(0));
        assert_eq!(relaxed, 0);
    }

    #[test]
    fn budget_is_exhausted_exactly() {
        let mut checks = 0u32;
        let mut relaxed = 0u32;
        let res = SpinPolicy::new(25).wait_until_relax(
            || {
                checks += 1;
                false
            },
            || relaxed += 1,
        );
        assert_eq!(res, Err(SpinTimeout { polls: 25 }));
        assert_eq!(relaxed, 25);
        assert_eq!(checks, 26);
    }

    #[test]
    fn condition_flipping_mid_wait_reports_progress() {
        let mut n = 0;
        let res = SpinPolicy::new(100).wait_until(|| {
            n += 1;
            n > 3
        });
        assert_eq!(res, Ok(3));
    }
}
