//! IRQ dispatch registry.
//!
//! Every line owns a chain of handlers, most recently installed first.
//! Dispatch asks the active controller which line is in service, walks that
//! chain until a handler claims the interrupt, then acknowledges the
//! controller exactly once. Hardware-specific handlers live in `drivers`;
//! the framework lives here so the dependency stays drivers -> core.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::RwLock;

use kestrel_lib::arch::idt::{EXCEPTION_VECTORS, IDT_ENTRIES};
use kestrel_lib::cpu::without_interrupts;
use kestrel_lib::{InterruptFrame, klog_debug, klog_info};

use crate::controller::{InterruptController, active_controller};

/// Every vector above the exception range can name a line.
pub const IRQ_LINES: usize = IDT_ENTRIES - EXCEPTION_VECTORS;

/// Legacy ISA line numbers.
pub const LEGACY_IRQ_TIMER: u8 = 0;
pub const LEGACY_IRQ_KEYBOARD: u8 = 1;
pub const LEGACY_IRQ_CASCADE: u8 = 2;
pub const LEGACY_IRQ_COM1: u8 = 4;
pub const LEGACY_IRQ_MOUSE: u8 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// The device behind this handler raised the interrupt; stop walking.
    Handled,
    /// Not ours (shared line); try the next handler.
    NotMine,
}

pub trait IrqHandler: Send + Sync {
    fn handle(&self, irq: u8, frame: &mut InterruptFrame) -> IrqReturn;

    fn name(&self) -> &'static str {
        "anonymous"
    }
}

/// [`IrqHandler`] over a plain function.
pub struct FnHandler {
    name: &'static str,
    func: fn(u8, &mut InterruptFrame) -> IrqReturn,
}

impl FnHandler {
    pub const fn new(name: &'static str, func: fn(u8, &mut InterruptFrame) -> IrqReturn) -> Self {
        Self { name, func }
    }
}

impl IrqHandler for FnHandler {
    fn handle(&self, irq: u8, frame: &mut InterruptFrame) -> IrqReturn {
        (self.func)(irq, frame)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Token naming one installed handler, valid until it is removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqError {
    InvalidLine(u8),
    NotInstalled,
    NoController,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IrqStats {
    pub count: u64,
    pub unhandled: u64,
    pub handlers: usize,
}

/// What [`IrqRegistry::dispatch`] did with one delivery. The controller is
/// acknowledged in every case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled { irq: u8 },
    Unhandled { irq: u8 },
    OutOfRange { irq: u8 },
    Spurious,
}

struct HandlerNode {
    id: HandlerId,
    cpu: Option<usize>,
    handler: Box<dyn IrqHandler>,
    next: Option<Box<HandlerNode>>,
}

type Chain = Option<Box<HandlerNode>>;

fn chain_iter(head: &Chain) -> impl Iterator<Item = &HandlerNode> {
    core::iter::successors(head.as_deref(), |node| node.next.as_deref())
}

/// Unlink the first node carrying `id`, keeping the order of the rest.
fn unlink(link: &mut Chain, id: HandlerId) -> Option<Box<HandlerNode>> {
    match link {
        Some(node) if node.id == id => {
            let mut removed = link.take()?;
            *link = removed.next.take();
            Some(removed)
        }
        Some(node) => unlink(&mut node.next, id),
        None => None,
    }
}

struct IrqLine {
    chain: RwLock<Chain>,
    count: AtomicU64,
    unhandled: AtomicU64,
    reported_unhandled: AtomicBool,
}

impl IrqLine {
    const fn new() -> Self {
        Self {
            chain: RwLock::new(None),
            count: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
            reported_unhandled: AtomicBool::new(false),
        }
    }
}

pub struct IrqRegistry {
    lines: [IrqLine; IRQ_LINES],
    next_id: AtomicU64,
}

impl Default for IrqRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqRegistry {
    pub const fn new() -> Self {
        Self {
            lines: [const { IrqLine::new() }; IRQ_LINES],
            next_id: AtomicU64::new(1),
        }
    }

    fn line(&self, irq: u8) -> Result<&IrqLine, IrqError> {
        self.lines
            .get(irq as usize)
            .ok_or(IrqError::InvalidLine(irq))
    }

    /// Put `handler` at the head of `irq`'s chain.
    pub fn install_handler(
        &self,
        irq: u8,
        handler: Box<dyn IrqHandler>,
    ) -> Result<HandlerId, IrqError> {
        self.install(irq, handler, None)
    }

    /// Like [`Self::install_handler`], but the handler only runs when the
    /// line is dispatched on processor `cpu`.
    pub fn install_handler_on(
        &self,
        irq: u8,
        handler: Box<dyn IrqHandler>,
        cpu: usize,
    ) -> Result<HandlerId, IrqError> {
        self.install(irq, handler, Some(cpu))
    }

    fn install(
        &self,
        irq: u8,
        handler: Box<dyn IrqHandler>,
        cpu: Option<usize>,
    ) -> Result<HandlerId, IrqError> {
        let line = match self.line(irq) {
            Ok(line) => line,
            Err(err) => {
                klog_info!("IRQ: Attempted to register handler for invalid line {}", irq);
                return Err(err);
            }
        };
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = handler.name();
        {
            let mut chain = line.chain.write();
            let next = chain.take();
            *chain = Some(Box::new(HandlerNode {
                id,
                cpu,
                handler,
                next,
            }));
        }
        line.reported_unhandled.store(false, Ordering::Relaxed);
        klog_debug!("IRQ: Registered handler for line {} ({})", irq, name);
        Ok(id)
    }

    /// Unlink the handler installed as `id` and hand it back.
    pub fn remove_handler(&self, irq: u8, id: HandlerId) -> Result<Box<dyn IrqHandler>, IrqError> {
        let line = self.line(irq)?;
        let removed = unlink(&mut line.chain.write(), id).ok_or(IrqError::NotInstalled)?;
        klog_debug!(
            "IRQ: Unregistered handler for line {} ({})",
            irq,
            removed.handler.name()
        );
        Ok(removed.handler)
    }

    pub fn handler_installed(&self, irq: u8, id: HandlerId) -> bool {
        self.line(irq)
            .is_ok_and(|line| chain_iter(&line.chain.read()).any(|node| node.id == id))
    }

    pub fn stats(&self, irq: u8) -> Option<IrqStats> {
        let line = self.line(irq).ok()?;
        Some(IrqStats {
            count: line.count.load(Ordering::Relaxed),
            unhandled: line.unhandled.load(Ordering::Relaxed),
            handlers: chain_iter(&line.chain.read()).count(),
        })
    }

    /// Service one delivery on `vector` for processor `cpu`.
    pub fn dispatch(
        &self,
        controller: &dyn InterruptController,
        vector: u8,
        frame: &mut InterruptFrame,
        cpu: usize,
    ) -> DispatchOutcome {
        let irq = controller.current_irq(vector);
        let outcome = match irq {
            None => DispatchOutcome::Spurious,
            Some(irq) if irq as usize >= controller.line_count().min(IRQ_LINES) => {
                klog_debug!(
                    "IRQ: vector {} names line {} outside {} ({} lines)",
                    vector,
                    irq,
                    controller.name(),
                    controller.line_count()
                );
                DispatchOutcome::OutOfRange { irq }
            }
            Some(irq) => self.run_chain(irq, vector, frame, cpu),
        };
        controller.eoi(vector, irq);
        outcome
    }

    fn run_chain(
        &self,
        irq: u8,
        vector: u8,
        frame: &mut InterruptFrame,
        cpu: usize,
    ) -> DispatchOutcome {
        let line = &self.lines[irq as usize];
        line.count.fetch_add(1, Ordering::Relaxed);

        let claimed = chain_iter(&line.chain.read())
            .filter(|node| node.cpu.is_none_or(|owner| owner == cpu))
            .any(|node| node.handler.handle(irq, frame) == IrqReturn::Handled);
        if claimed {
            return DispatchOutcome::Handled { irq };
        }

        line.unhandled.fetch_add(1, Ordering::Relaxed);
        if !line.reported_unhandled.swap(true, Ordering::Relaxed) {
            klog_info!("IRQ: Unhandled IRQ {} (vector {})", irq, vector);
        }
        DispatchOutcome::Unhandled { irq }
    }

    pub fn mask_line(&self, controller: &dyn InterruptController, irq: u8) -> Result<(), IrqError> {
        if irq as usize >= controller.line_count() {
            return Err(IrqError::InvalidLine(irq));
        }
        controller.mask_line(irq);
        Ok(())
    }

    pub fn unmask_line(
        &self,
        controller: &dyn InterruptController,
        irq: u8,
    ) -> Result<(), IrqError> {
        if irq as usize >= controller.line_count() {
            return Err(IrqError::InvalidLine(irq));
        }
        self.line(irq)?.reported_unhandled.store(false, Ordering::Relaxed);
        controller.unmask_line(irq);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kernel-wide registry
// ---------------------------------------------------------------------------

static IRQ_REGISTRY: IrqRegistry = IrqRegistry::new();

#[inline]
pub fn registry() -> &'static IrqRegistry {
    &IRQ_REGISTRY
}

// Chain writers hold the line lock; an IRQ on the same CPU would spin on
// the read side forever, so every writer runs with interrupts off.

pub fn install_handler(irq: u8, handler: Box<dyn IrqHandler>) -> Result<HandlerId, IrqError> {
    without_interrupts(|| IRQ_REGISTRY.install_handler(irq, handler))
}

pub fn install_handler_on(
    irq: u8,
    handler: Box<dyn IrqHandler>,
    cpu: usize,
) -> Result<HandlerId, IrqError> {
    without_interrupts(|| IRQ_REGISTRY.install_handler_on(irq, handler, cpu))
}

pub fn remove_handler(irq: u8, id: HandlerId) -> Result<Box<dyn IrqHandler>, IrqError> {
    without_interrupts(|| IRQ_REGISTRY.remove_handler(irq, id))
}

pub fn handler_installed(irq: u8, id: HandlerId) -> bool {
    IRQ_REGISTRY.handler_installed(irq, id)
}

pub fn get_stats(irq: u8) -> Option<IrqStats> {
    IRQ_REGISTRY.stats(irq)
}

pub fn mask_irq_line(irq: u8) -> Result<(), IrqError> {
    let controller = active_controller().ok_or(IrqError::NoController)?;
    IRQ_REGISTRY.mask_line(controller, irq)
}

pub fn unmask_irq_line(irq: u8) -> Result<(), IrqError> {
    let controller = active_controller().ok_or(IrqError::NoController)?;
    IRQ_REGISTRY.unmask_line(controller, irq)
}

/// Entry from the common interrupt stub for every vector above the
/// exception range except the spurious vector.
pub fn irq_dispatch(frame: &mut InterruptFrame) -> DispatchOutcome {
    let vector = frame.vector();
    let Some(controller) = active_controller() else {
        klog_info!("IRQ: Dispatch of vector {} before controller setup", vector);
        return DispatchOutcome::Spurious;
    };
    IRQ_REGISTRY.dispatch(controller, vector, frame, crate::smp::current_cpu_index())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::*;
    use crate::controller::test_support::{Call, FakeController};

    const BASE: u8 = 0x20;

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    struct Probe {
        name: &'static str,
        verdict: IrqReturn,
        trace: Trace,
    }

    impl IrqHandler for Probe {
        fn handle(&self, _irq: u8, frame: &mut InterruptFrame) -> IrqReturn {
            frame.rax += 1;
            self.trace.lock().unwrap().push(self.name);
            self.verdict
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    fn probe(name: &'static str, verdict: IrqReturn, trace: &Trace) -> Box<dyn IrqHandler> {
        Box::new(Probe {
            name,
            verdict,
            trace: trace.clone(),
        })
    }

    fn fire(registry: &IrqRegistry, ctl: &FakeController, irq: u8, cpu: usize) -> DispatchOutcome {
        let vector = BASE + irq;
        let mut frame = InterruptFrame::for_vector(vector, 0);
        registry.dispatch(ctl, vector, &mut frame, cpu)
    }

    #[test]
    fn stray_irq_before_controller_setup_is_spurious() {
        assert!(active_controller().is_none());
        let mut frame = InterruptFrame::for_vector(0x27, 0);
        assert_eq!(irq_dispatch(&mut frame), DispatchOutcome::Spurious);
    }

    #[test]
    fn newest_handler_runs_first_and_claim_stops_the_walk() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        let trace = Trace::default();
        registry.install_handler(5, probe("h1", IrqReturn::Handled, &trace)).unwrap();
        registry.install_handler(5, probe("h2", IrqReturn::Handled, &trace)).unwrap();

        assert_eq!(fire(&registry, &ctl, 5, 0), DispatchOutcome::Handled { irq: 5 });
        assert_eq!(*trace.lock().unwrap(), ["h2"]);
        assert_eq!(ctl.eoi_count(), 1);
    }

    #[test]
    fn shared_line_falls_through_until_claimed() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        let trace = Trace::default();
        registry.install_handler(9, probe("disk", IrqReturn::Handled, &trace)).unwrap();
        registry.install_handler(9, probe("nic", IrqReturn::NotMine, &trace)).unwrap();

        let mut frame = InterruptFrame::for_vector(BASE + 9, 0);
        let outcome = registry.dispatch(&ctl, BASE + 9, &mut frame, 0);
        assert_eq!(outcome, DispatchOutcome::Handled { irq: 9 });
        assert_eq!(*trace.lock().unwrap(), ["nic", "disk"]);
        assert_eq!(frame.rax, 2);
    }

    #[test]
    fn eoi_exactly_once_without_handlers() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        assert_eq!(fire(&registry, &ctl, 3, 0), DispatchOutcome::Unhandled { irq: 3 });
        assert_eq!(
            ctl.calls(),
            [Call::Eoi {
                vector: BASE + 3,
                irq: Some(3)
            }]
        );
    }

    #[test]
    fn eoi_exactly_once_when_every_handler_declines() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        let trace = Trace::default();
        registry.install_handler(4, probe("a", IrqReturn::NotMine, &trace)).unwrap();
        registry.install_handler(4, probe("b", IrqReturn::NotMine, &trace)).unwrap();

        assert_eq!(fire(&registry, &ctl, 4, 0), DispatchOutcome::Unhandled { irq: 4 });
        assert_eq!(trace.lock().unwrap().len(), 2);
        assert_eq!(ctl.eoi_count(), 1);
        let stats = registry.stats(4).unwrap();
        assert_eq!((stats.count, stats.unhandled, stats.handlers), (1, 1, 2));
    }

    #[test]
    fn eoi_exactly_once_for_out_of_range_and_spurious() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 16);
        let trace = Trace::default();
        registry.install_handler(20, probe("late", IrqReturn::Handled, &trace)).unwrap();

        assert_eq!(fire(&registry, &ctl, 20, 0), DispatchOutcome::OutOfRange { irq: 20 });
        assert!(trace.lock().unwrap().is_empty());
        assert_eq!(ctl.eoi_count(), 1);

        let mut frame = InterruptFrame::for_vector(0x10, 0);
        assert_eq!(
            registry.dispatch(&ctl, 0x10, &mut frame, 0),
            DispatchOutcome::Spurious
        );
        assert_eq!(ctl.eoi_count(), 2);
        assert_eq!(registry.stats(20).unwrap().count, 0);
    }

    #[test]
    fn cpu_affine_handler_only_runs_on_its_cpu() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        let trace = Trace::default();
        registry
            .install_handler_on(0, probe("cpu1-timer", IrqReturn::Handled, &trace), 1)
            .unwrap();

        assert_eq!(fire(&registry, &ctl, 0, 0), DispatchOutcome::Unhandled { irq: 0 });
        assert_eq!(fire(&registry, &ctl, 0, 1), DispatchOutcome::Handled { irq: 0 });
        assert_eq!(*trace.lock().unwrap(), ["cpu1-timer"]);
    }

    #[test]
    fn remove_keeps_order_of_the_rest() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        let trace = Trace::default();
        let a = registry.install_handler(7, probe("a", IrqReturn::NotMine, &trace)).unwrap();
        let b = registry.install_handler(7, probe("b", IrqReturn::NotMine, &trace)).unwrap();
        let c = registry.install_handler(7, probe("c", IrqReturn::NotMine, &trace)).unwrap();

        let removed = registry.remove_handler(7, b).unwrap();
        assert_eq!(removed.name(), "b");
        assert!(!registry.handler_installed(7, b));
        assert!(registry.handler_installed(7, a));
        assert!(registry.handler_installed(7, c));
        assert_eq!(registry.remove_handler(7, b).err(), Some(IrqError::NotInstalled));
        assert_eq!(registry.remove_handler(6, a).err(), Some(IrqError::NotInstalled));

        fire(&registry, &ctl, 7, 0);
        assert_eq!(*trace.lock().unwrap(), ["c", "a"]);
    }

    #[test]
    fn lines_beyond_capacity_are_rejected() {
        let registry = IrqRegistry::new();
        let trace = Trace::default();
        let last = (IRQ_LINES - 1) as u8;
        assert!(registry.install_handler(last, probe("ok", IrqReturn::Handled, &trace)).is_ok());
        assert_eq!(
            registry.install_handler(last + 1, probe("no", IrqReturn::Handled, &trace)).err(),
            Some(IrqError::InvalidLine(last + 1))
        );
        assert!(registry.stats(last + 1).is_none());
    }

    #[test]
    fn unhandled_line_is_reported_once_until_reinstalled() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        fire(&registry, &ctl, 11, 0);
        assert!(registry.lines[11].reported_unhandled.load(Ordering::Relaxed));
        fire(&registry, &ctl, 11, 0);
        assert_eq!(registry.stats(11).unwrap().unhandled, 2);

        let trace = Trace::default();
        registry.install_handler(11, probe("late", IrqReturn::Handled, &trace)).unwrap();
        assert!(!registry.lines[11].reported_unhandled.load(Ordering::Relaxed));
    }

    #[test]
    fn masking_is_forwarded_within_controller_range() {
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 16);
        registry.mask_line(&ctl, 1).unwrap();
        registry.unmask_line(&ctl, 1).unwrap();
        assert_eq!(registry.mask_line(&ctl, 16), Err(IrqError::InvalidLine(16)));
        assert_eq!(ctl.calls(), [Call::Mask(1), Call::Unmask(1)]);
    }

    #[test]
    fn fn_handler_forwards_to_the_function() {
        fn count(irq: u8, frame: &mut InterruptFrame) -> IrqReturn {
            frame.rbx = irq as u64;
            IrqReturn::Handled
        }
        let registry = IrqRegistry::new();
        let ctl = FakeController::new(BASE, 24);
        registry
            .install_handler(2, Box::new(FnHandler::new("count", count)))
            .unwrap();
        let mut frame = InterruptFrame::for_vector(BASE + 2, 0);
        registry.dispatch(&ctl, BASE + 2, &mut frame, 0);
        assert_eq!(frame.rbx, 2);
    }
}
