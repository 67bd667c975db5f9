//! Seam between the dispatch registry and whichever interrupt controller the
//! boot path brought up (8259 pair or I/O APIC + Local APIC).
//!
//! Registered once by `kestrel-boot` after the controller is programmed, the
//! same way drivers publish their services at boot.

use spin::RwLock;

use kestrel_lib::klog_debug;

pub trait InterruptController: Sync {
    fn name(&self) -> &'static str;

    /// Number of lines the controller can report from [`Self::current_irq`].
    fn line_count(&self) -> usize;

    /// Line being serviced for a delivery on `vector`, `None` when the
    /// in-service state names no line (spurious delivery).
    fn current_irq(&self, vector: u8) -> Option<u8>;

    /// Acknowledge the delivery on `vector`. Called exactly once per
    /// dispatched vector, after every handler has run.
    fn eoi(&self, vector: u8, irq: Option<u8>);

    fn mask_line(&self, irq: u8);
    fn unmask_line(&self, irq: u8);
}

static ACTIVE: RwLock<Option<&'static dyn InterruptController>> = RwLock::new(None);

/// Publish the controller that owns IRQ delivery from now on.
pub fn set_active_controller(controller: &'static dyn InterruptController) {
    klog_debug!(
        "IRQ: {} owns {} lines",
        controller.name(),
        controller.line_count()
    );
    *ACTIVE.write() = Some(controller);
}

#[inline]
pub fn active_controller() -> Option<&'static dyn InterruptController> {
    *ACTIVE.read()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::vec::Vec;

    use super::InterruptController;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Call {
        Eoi { vector: u8, irq: Option<u8> },
        Mask(u8),
        Unmask(u8),
    }

    /// Controller double whose in-service line is `vector - base`.
    pub struct FakeController {
        pub base: u8,
        pub lines: usize,
        pub calls: Mutex<Vec<Call>>,
    }

    impl FakeController {
        pub fn new(base: u8, lines: usize) -> Self {
            Self {
                base,
                lines,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn eoi_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Eoi { .. }))
                .count()
        }
    }

    impl InterruptController for FakeController {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn line_count(&self) -> usize {
            self.lines
        }

        fn current_irq(&self, vector: u8) -> Option<u8> {
            vector.checked_sub(self.base)
        }

        fn eoi(&self, vector: u8, irq: Option<u8>) {
            self.calls.lock().unwrap().push(Call::Eoi { vector, irq });
        }

        fn mask_line(&self, irq: u8) {
            self.calls.lock().unwrap().push(Call::Mask(irq));
        }

        fn unmask_line(&self, irq: u8) {
            self.calls.lock().unwrap().push(Call::Unmask(irq));
        }
    }
}
