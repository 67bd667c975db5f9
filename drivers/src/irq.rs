//! Controller selection and the periodic tick.
//!
//! Picks I/O APIC + Local APIC routing when the CPU and the firmware tables
//! support it, the 8259 pair otherwise, publishes the choice as the active
//! controller and arms the tick on IRQ 0.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU8, Ordering};

use kestrel_acpi::{InterruptMode, PlatformTables};
use kestrel_core::irq::{self, LEGACY_IRQ_TIMER};
use kestrel_core::timer::TimerTick;
use kestrel_core::{InterruptConfig, InterruptController, set_active_controller};
use kestrel_lib::{InitOnce, klog_debug, klog_info, klog_warn};
use kestrel_mm::{DevicePaging, MmioRegion, RegisterBus};

use crate::apic::{self, LAPIC_SPURIOUS_VECTOR, LocalApic};
use crate::ioapic::{self, ISA_IRQ_COUNT, IoApic};
use crate::{pic, pit};

/// I/O APIC pins delivered through the Local APIC.
pub struct ApicController<'a, L: RegisterBus, I: RegisterBus> {
    lapic: &'a LocalApic<L>,
    ioapic: &'a IoApic<I>,
    irq_base: u8,
}

impl<'a, L: RegisterBus, I: RegisterBus> ApicController<'a, L, I> {
    pub const fn new(lapic: &'a LocalApic<L>, ioapic: &'a IoApic<I>, irq_base: u8) -> Self {
        Self {
            lapic,
            ioapic,
            irq_base,
        }
    }

    pub fn irq_base(&self) -> u8 {
        self.irq_base
    }

    fn lines(&self) -> usize {
        (self.ioapic.max_redirection() as usize)
            .max(ISA_IRQ_COUNT)
            .min(LAPIC_SPURIOUS_VECTOR as usize - self.irq_base as usize)
    }
}

impl<L, I> InterruptController for ApicController<'_, L, I>
where
    L: RegisterBus + Sync,
    I: RegisterBus + Send,
{
    fn name(&self) -> &'static str {
        "I/O APIC"
    }

    fn line_count(&self) -> usize {
        self.lines()
    }

    fn current_irq(&self, _vector: u8) -> Option<u8> {
        self.lapic.in_service(self.irq_base, self.lines())
    }

    fn eoi(&self, vector: u8, _irq: Option<u8>) {
        // The spurious vector never sets an ISR bit.
        if vector != LAPIC_SPURIOUS_VECTOR {
            self.lapic.eoi();
        }
    }

    fn mask_line(&self, irq: u8) {
        if let Err(err) = self.ioapic.disable_interrupt(irq) {
            klog_warn!("IRQ: Cannot mask line {}: {:?}", irq, err);
        }
    }

    fn unmask_line(&self, irq: u8) {
        let vector = self.irq_base.wrapping_add(irq);
        if let Err(err) = self.ioapic.enable_interrupt(irq, vector) {
            klog_warn!("IRQ: Cannot unmask line {}: {:?}", irq, err);
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqMode {
    Uninitialized = 0,
    Pic = 1,
    Apic = 2,
}

static MODE: AtomicU8 = AtomicU8::new(IrqMode::Uninitialized as u8);
static APIC_CONTROLLER: InitOnce<ApicController<'static, MmioRegion, MmioRegion>> =
    InitOnce::new();

pub fn irq_mode() -> IrqMode {
    match MODE.load(Ordering::Acquire) {
        1 => IrqMode::Pic,
        2 => IrqMode::Apic,
        _ => IrqMode::Uninitialized,
    }
}

fn try_apic(
    cfg: &InterruptConfig,
    platform: &dyn PlatformTables,
    paging: &dyn DevicePaging,
) -> Option<&'static ApicController<'static, MmioRegion, MmioRegion>> {
    if cfg.force_pic {
        klog_info!("IRQ: APIC disabled on the command line");
        return None;
    }
    if !apic::supported() || !platform.supported() {
        klog_info!("IRQ: No APIC support, using the 8259 PIC");
        return None;
    }
    if !platform.change_interrupt_mode(InterruptMode::Apic) {
        klog_info!("IRQ: Firmware refused APIC mode");
        return None;
    }

    let lapic = match apic::init(paging, platform.has_legacy_pics()) {
        Ok(lapic) => lapic,
        Err(err) => {
            klog_info!("IRQ: Local APIC unavailable: {:?}", err);
            return None;
        }
    };
    let ioapic = attach_ioapic(lapic, || ioapic::ioapic_init(platform, paging))?;

    let controller = APIC_CONTROLLER
        .init(|| ApicController::new(lapic, ioapic, cfg.pic_master_offset))
        .ok();
    if controller.is_none() {
        lapic.route_legacy_pic();
    }
    controller
}

/// Pair the enabled Local APIC with an I/O APIC. When there is none the
/// 8259 pair stays in charge and its INTR must reach the core through LINT0.
fn attach_ioapic<L: RegisterBus, T, E: core::fmt::Debug>(
    lapic: &LocalApic<L>,
    probe: impl FnOnce() -> Result<T, E>,
) -> Option<T> {
    match probe() {
        Ok(ioapic) => Some(ioapic),
        Err(err) => {
            klog_info!("IRQ: No usable I/O APIC ({:?}), staying on the 8259 PIC", err);
            lapic.route_legacy_pic();
            None
        }
    }
}

/// Program the interrupt controllers and start the tick.
///
/// Runs once on the boot processor after the IDT is loaded and before
/// interrupts are enabled.
pub fn irqs_init(
    cfg: &InterruptConfig,
    platform: &dyn PlatformTables,
    paging: &dyn DevicePaging,
) -> IrqMode {
    klog_debug!("IRQ: Initializing...");
    let pic = pic::pic();
    pic.set_offsets(cfg.pic_master_offset, cfg.pic_slave_offset);

    let mode = match try_apic(cfg, platform, paging) {
        Some(controller) => {
            set_active_controller(controller);
            start_apic_tick(controller.irq_base(), cfg.timer_hz);
            IrqMode::Apic
        }
        None => {
            platform.change_interrupt_mode(InterruptMode::Pic);
            pic.enable();
            set_active_controller(pic);
            let hz = pit::pit_set_frequency(cfg.timer_hz);
            klog_info!("IRQ: PIT tick at {} Hz", hz);
            IrqMode::Pic
        }
    };
    MODE.store(mode as u8, Ordering::Release);

    if let Err(err) = irq::install_handler(LEGACY_IRQ_TIMER, Box::new(TimerTick::new(cfg.timer_hz)))
    {
        klog_warn!("IRQ: Cannot install the tick handler: {:?}", err);
    }
    klog_debug!("IRQ: Initialized ({:?})", mode);
    mode
}

fn start_apic_tick(irq_base: u8, hz: u32) {
    let vector = irq_base.wrapping_add(LEGACY_IRQ_TIMER);
    let started = apic::timer::timer_calibrate()
        .and_then(|_| apic::timer::timer_start_periodic(vector, hz));
    if let Err(err) = started {
        klog_warn!("IRQ: LAPIC timer not started: {:?}", err);
    }
}

/// Per-processor part on an application processor: its own Local APIC and
/// tick. Nothing to do under the 8259 pair.
pub fn irqs_init_ap(cpu_index: usize, cfg: &InterruptConfig) {
    if irq_mode() != IrqMode::Apic {
        return;
    }
    if let Err(err) = apic::ap_init(cpu_index) {
        klog_warn!("IRQ: CPU {} Local APIC: {:?}", cpu_index, err);
        return;
    }
    if let Some(controller) = APIC_CONTROLLER.get() {
        start_apic_tick_ap(controller.irq_base(), cfg.timer_hz);
    }
}

fn start_apic_tick_ap(irq_base: u8, hz: u32) {
    let vector = irq_base.wrapping_add(LEGACY_IRQ_TIMER);
    if let Err(err) = apic::timer::timer_start_periodic(vector, hz) {
        klog_warn!("IRQ: LAPIC timer not started: {:?}", err);
    }
}

#[cfg(test)]
mod tests {
    use kestrel_acpi::{IoapicInfo, MadtEntry};

    use super::*;
    use crate::apic::regs::{
        LAPIC_LVT_DELIVERY_EXTINT, LAPIC_LVT_LINT0, LAPIC_LVT_MASKED, isr_word,
    };
    use crate::ioapic::IoApicError;
    use crate::ioapic::regs::redir_low_index;
    use crate::test_support::{FakeIoWindow, FakePlatform, FakeRegisters};

    fn ioapic() -> IoApic<FakeIoWindow> {
        let platform = FakePlatform::new(&[MadtEntry::Ioapic(IoapicInfo {
            id: 0,
            address: 0xFEC0_0000,
            gsi_base: 0,
        })]);
        IoApic::probe(&platform, 1, |_| Ok(FakeIoWindow::new(0x0017_0011))).unwrap()
    }

    #[test]
    fn failed_ioapic_probe_opens_lint0_for_the_pic() {
        let lapic = LocalApic::new(FakeRegisters::new(), 0);
        lapic.enable_local(0);
        assert_eq!(lapic.regs().get(LAPIC_LVT_LINT0), LAPIC_LVT_MASKED);

        let platform = FakePlatform::new(&[]);
        let attached = attach_ioapic(&lapic, || {
            IoApic::probe(&platform, 0, |_| Ok(FakeIoWindow::new(0x0017_0011)))
        });
        assert!(attached.is_none());

        let lint0 = lapic.regs().get(LAPIC_LVT_LINT0);
        assert_eq!(lint0 & LAPIC_LVT_MASKED, 0);
        assert_eq!(lint0, LAPIC_LVT_DELIVERY_EXTINT);
    }

    #[test]
    fn attached_ioapic_leaves_lint0_masked() {
        let lapic = LocalApic::new(FakeRegisters::new(), 0);
        lapic.enable_local(0);
        assert!(attach_ioapic(&lapic, || Ok::<_, IoApicError>(ioapic())).is_some());
        assert_eq!(lapic.regs().get(LAPIC_LVT_LINT0), LAPIC_LVT_MASKED);
    }

    #[test]
    fn in_service_vector_names_the_line() {
        let lapic = LocalApic::new(FakeRegisters::new(), 0);
        let ioapic = ioapic();
        let ctl = ApicController::new(&lapic, &ioapic, 0x20);

        assert_eq!(ctl.line_count(), 24);
        lapic.regs().set(isr_word(1), 1 << 4);
        assert_eq!(ctl.current_irq(0x24), Some(4));
        lapic.regs().set(isr_word(1), 0);
        assert_eq!(ctl.current_irq(0x24), None);
    }

    #[test]
    fn spurious_vector_gets_no_eoi() {
        let lapic = LocalApic::new(FakeRegisters::new(), 0);
        let ioapic = ioapic();
        let ctl = ApicController::new(&lapic, &ioapic, 0x20);

        ctl.eoi(LAPIC_SPURIOUS_VECTOR, None);
        assert!(lapic.regs().writes().is_empty());
        ctl.eoi(0x21, Some(1));
        assert_eq!(lapic.regs().writes().len(), 1);
    }

    #[test]
    fn unmask_routes_line_to_base_vector() {
        let lapic = LocalApic::new(FakeRegisters::new(), 0);
        let ioapic = ioapic();
        let ctl = ApicController::new(&lapic, &ioapic, 0x30);

        ctl.unmask_line(3);
        let entry = ioapic.read_entry(3).unwrap();
        assert!(!entry.is_masked());
        assert_eq!(entry.vector(), 0x33);
        assert_eq!(entry.destination(), 1);

        ctl.mask_line(3);
        assert!(ioapic.read_entry(3).unwrap().is_masked());
        assert_eq!(ioapic.regs().reg(redir_low_index(3)) & 0xFF, 0x33);
    }
}
