//! Local APIC: per-processor enable, EOI, IPIs, in-service lookup and the
//! periodic timer.

pub mod regs;
pub mod timer;

use kestrel_lib::cpu::cpuid::has_local_apic;
use kestrel_lib::cpu::msr::{ApicBaseMsr, MSR_APIC_BASE, read_msr, write_msr};
use kestrel_lib::init_once::InitError;
use kestrel_lib::{InitOnce, SpinPolicy, kfatal, klog_debug, klog_info, klog_warn};
use kestrel_mm::{DevicePaging, MmioRegion, PagingError, PhysAddr, RegisterBus};

pub use regs::{IcrCommand, IcrDelivery, IcrFlags, LAPIC_SPURIOUS_VECTOR};
use regs::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApicError {
    Unsupported,
    Map(PagingError),
    AlreadyInitialized,
    NotInitialized,
}

impl From<PagingError> for ApicError {
    fn from(err: PagingError) -> Self {
        Self::Map(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpiError {
    /// Delivery status stayed pending for the whole poll budget.
    Timeout { apic_id: u8 },
}

/// xAPIC register page of the executing processor.
///
/// Every processor sees its own APIC at the same physical address, so one
/// mapping serves all of them.
pub struct LocalApic<R: RegisterBus> {
    regs: R,
    phys_base: u64,
}

impl<R: RegisterBus> LocalApic<R> {
    pub const fn new(regs: R, phys_base: u64) -> Self {
        Self { regs, phys_base }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    #[inline]
    fn read(&self, reg: usize) -> u32 {
        self.regs.read32(reg)
    }

    #[inline]
    fn write(&self, reg: usize, value: u32) {
        self.regs.write32(reg, value);
    }

    pub fn id(&self) -> u32 {
        self.read(LAPIC_ID) >> 24
    }

    pub fn version(&self) -> u32 {
        self.read(LAPIC_VERSION) & 0xFF
    }

    /// Software-enable this processor's APIC in flat logical mode.
    ///
    /// Leaves every local interrupt source masked; the timer is armed
    /// separately.
    pub fn enable_local(&self, cpu_index: usize) {
        self.write(LAPIC_TPR, 0);
        self.write(LAPIC_DFR, LAPIC_DFR_FLAT);
        self.write(LAPIC_LDR, 1 << (LAPIC_LDR_SHIFT + (cpu_index % 8) as u32));

        let spurious = self.read(LAPIC_SPURIOUS) & !0xFF;
        self.write(
            LAPIC_SPURIOUS,
            spurious | LAPIC_SPURIOUS_ENABLE | LAPIC_SPURIOUS_VECTOR as u32,
        );

        self.write(LAPIC_LVT_TIMER, LAPIC_LVT_MASKED);
        self.write(LAPIC_LVT_PERFCNT, LAPIC_LVT_MASKED);
        self.write(LAPIC_LVT_LINT0, LAPIC_LVT_MASKED);
        self.write(LAPIC_LVT_LINT1, LAPIC_LVT_MASKED);
        self.write(LAPIC_LVT_ERROR, LAPIC_LVT_MASKED);

        // ESR is write-then-read; two writes clear a stale latch.
        self.write(LAPIC_ESR, 0);
        self.write(LAPIC_ESR, 0);

        klog_debug!(
            "APIC: CPU {} ID 0x{:x}, version 0x{:x}",
            cpu_index,
            self.id(),
            self.version()
        );
    }

    /// Virtual wire mode: 8259 INTR arrives as ExtINT on LINT0 and NMI on
    /// LINT1. Used when the APIC is up but routing stays on the 8259 pair.
    pub fn route_legacy_pic(&self) {
        self.write(LAPIC_LVT_LINT0, LAPIC_LVT_DELIVERY_EXTINT);
        self.write(LAPIC_LVT_LINT1, LAPIC_LVT_DELIVERY_NMI);
        klog_debug!("APIC: LINT0 set to ExtINT for the 8259 pair");
    }

    pub fn disable_local(&self) {
        let spurious = self.read(LAPIC_SPURIOUS);
        self.write(LAPIC_SPURIOUS, spurious & !LAPIC_SPURIOUS_ENABLE);
    }

    pub fn is_enabled(&self) -> bool {
        self.read(LAPIC_SPURIOUS) & LAPIC_SPURIOUS_ENABLE != 0
    }

    #[inline]
    pub fn eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    pub fn error_status(&self) -> u32 {
        self.write(LAPIC_ESR, 0);
        self.read(LAPIC_ESR)
    }

    fn delivery_pending(&self) -> bool {
        IcrFlags::from_bits_truncate(self.read(LAPIC_ICR_LOW)).contains(IcrFlags::DELIVERY_PENDING)
    }

    /// Write ICR high then low and wait for the APIC to accept the command.
    pub fn send_ipi(&self, command: IcrCommand, policy: SpinPolicy) -> Result<(), IpiError> {
        self.write(LAPIC_ICR_HIGH, command.high());
        self.write(LAPIC_ICR_LOW, command.low());
        policy
            .wait_until(|| !self.delivery_pending())
            .map(|_| ())
            .map_err(|timeout| {
                klog_warn!(
                    "APIC: IPI 0x{:x} to APIC {} still pending after {} polls",
                    command.low(),
                    command.destination(),
                    timeout.polls
                );
                IpiError::Timeout {
                    apic_id: command.destination(),
                }
            })
    }

    pub fn send_init(&self, apic_id: u8, policy: SpinPolicy) -> Result<(), IpiError> {
        self.send_ipi(IcrCommand::init(apic_id), policy)
    }

    pub fn send_startup(&self, apic_id: u8, page: u8, policy: SpinPolicy) -> Result<(), IpiError> {
        self.send_ipi(IcrCommand::startup(apic_id, page), policy)
    }

    /// Line of the first in-service vector, scanning ISR words upward and
    /// taking each word's lowest set bit, that falls in
    /// `irq_base..irq_base + lines`.
    pub fn in_service(&self, irq_base: u8, lines: usize) -> Option<u8> {
        (0..LAPIC_ISR_WORDS).find_map(|word| {
            let bits = self.read(isr_word(word));
            if bits == 0 {
                return None;
            }
            let vector = word * 32 + bits.trailing_zeros() as usize;
            vector
                .checked_sub(irq_base as usize)
                .filter(|irq| *irq < lines)
                .map(|irq| irq as u8)
        })
    }

    pub fn timer_current_count(&self) -> u32 {
        self.read(LAPIC_TIMER_CCR)
    }
}

// -----------------------------------------------------------------------------
// Processor-wide state
// -----------------------------------------------------------------------------

/// CPUID.01H:EDX bit 9.
pub fn supported() -> bool {
    has_local_apic()
}

/// Set the global enable bit in IA32_APIC_BASE; returns the register page
/// physical base.
fn enable_global() -> u64 {
    let mut base = read_msr(MSR_APIC_BASE);
    if base & ApicBaseMsr::GLOBAL_ENABLE == 0 {
        base |= ApicBaseMsr::GLOBAL_ENABLE;
        write_msr(MSR_APIC_BASE, base);
        klog_debug!("APIC: Enabled APIC globally via MSR");
    }
    base & ApicBaseMsr::ADDR_MASK
}

static LAPIC: InitOnce<LocalApic<MmioRegion>> = InitOnce::new();

#[inline]
pub fn lapic() -> Option<&'static LocalApic<MmioRegion>> {
    LAPIC.get()
}

fn current_id() -> u32 {
    lapic().map_or(0, |apic| apic.id())
}

/// Bring up the boot processor's Local APIC. Masks the 8259 pair first
/// when `legacy_pics` says it is wired.
pub fn init(
    paging: &dyn DevicePaging,
    legacy_pics: bool,
) -> Result<&'static LocalApic<MmioRegion>, ApicError> {
    if !supported() {
        klog_info!("APIC: Local APIC is not available");
        return Err(ApicError::Unsupported);
    }
    if LAPIC.is_claimed() {
        kfatal!("APIC: init called twice");
    }
    klog_debug!("APIC: Initializing...");

    let phys = enable_global();
    if legacy_pics {
        crate::pic::pic().disable();
    }

    let apic = LAPIC
        .try_init(|| {
            let region = MmioRegion::map(paging, PhysAddr::new(phys), LAPIC_REGION_SIZE)?;
            Ok::<_, ApicError>(LocalApic::new(region, phys))
        })
        .map_err(|err| match err {
            InitError::AlreadyInitialized => ApicError::AlreadyInitialized,
            InitError::Failed(err) => err,
        })?;

    apic.enable_local(0);
    apic.eoi();
    kestrel_lib::register_lapic_id_fn(current_id);

    klog_debug!("APIC: Physical base 0x{:x}", phys);
    klog_debug!("APIC: Initialized");
    Ok(apic)
}

/// Enable the calling application processor's Local APIC.
pub fn ap_init(cpu_index: usize) -> Result<(), ApicError> {
    let apic = lapic().ok_or(ApicError::NotInitialized)?;
    enable_global();
    apic.enable_local(cpu_index);
    Ok(())
}

#[inline]
pub fn send_eoi() {
    if let Some(apic) = lapic() {
        apic.eoi();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRegisters;

    fn apic() -> LocalApic<FakeRegisters> {
        LocalApic::new(FakeRegisters::new(), 0xFEE0_0000)
    }

    /// ICR that never reports the command as accepted.
    struct StuckIcr(FakeRegisters);

    impl RegisterBus for StuckIcr {
        fn read32(&self, offset: usize) -> u32 {
            let value = self.0.read32(offset);
            if offset == LAPIC_ICR_LOW {
                value | IcrFlags::DELIVERY_PENDING.bits()
            } else {
                value
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            self.0.write32(offset, value);
        }
    }

    #[test]
    fn enable_programs_flat_mode_and_masks_local_sources() {
        let apic = apic();
        apic.regs().set(LAPIC_ID, 3 << 24);
        apic.regs().set(LAPIC_SPURIOUS, 0x0000_000F);
        apic.enable_local(9);

        let regs = apic.regs();
        assert_eq!(regs.get(LAPIC_TPR), 0);
        assert_eq!(regs.get(LAPIC_DFR), 0xFFFF_FFFF);
        assert_eq!(regs.get(LAPIC_LDR), 1 << 25);
        assert_eq!(regs.get(LAPIC_SPURIOUS), 0x1FF);
        for lvt in [LAPIC_LVT_LINT0, LAPIC_LVT_LINT1, LAPIC_LVT_ERROR, LAPIC_LVT_TIMER] {
            assert_eq!(regs.get(lvt), LAPIC_LVT_MASKED);
        }
        assert_eq!(regs.writes_to(LAPIC_ESR), [0, 0]);
        assert_eq!(apic.id(), 3);
        assert!(apic.is_enabled());
    }

    #[test]
    fn eoi_writes_zero_once() {
        let apic = apic();
        apic.eoi();
        assert_eq!(apic.regs().writes(), [(LAPIC_EOI, 0)]);
    }

    #[test]
    fn ipis_write_high_half_first() {
        let apic = apic();
        apic.send_init(5, SpinPolicy::new(4)).unwrap();
        apic.send_startup(5, 0x08, SpinPolicy::new(4)).unwrap();
        assert_eq!(
            apic.regs().writes(),
            [
                (LAPIC_ICR_HIGH, 5 << 24),
                (LAPIC_ICR_LOW, 0x4500),
                (LAPIC_ICR_HIGH, 5 << 24),
                (LAPIC_ICR_LOW, 0x4608),
            ]
        );
    }

    #[test]
    fn stuck_delivery_status_times_out() {
        let apic = LocalApic::new(StuckIcr(FakeRegisters::new()), 0);
        assert_eq!(
            apic.send_init(7, SpinPolicy::new(16)),
            Err(IpiError::Timeout { apic_id: 7 })
        );
    }

    #[test]
    fn in_service_scans_words_for_a_line() {
        let apic = apic();
        assert_eq!(apic.in_service(0x20, 24), None);

        // Vector 0x21 in word 1.
        apic.regs().set(isr_word(1), 1 << 1);
        assert_eq!(apic.in_service(0x20, 24), Some(1));

        // Below the IRQ base: skipped, next word still scanned.
        apic.regs().set(isr_word(0), 1 << 14);
        assert_eq!(apic.in_service(0x20, 24), Some(1));

        // Beyond the line count.
        apic.regs().set(isr_word(1), 0);
        apic.regs().set(isr_word(7), 1 << 31);
        assert_eq!(apic.in_service(0x20, 24), None);
    }

    #[test]
    fn legacy_routing_unmasks_lint0_as_extint() {
        let apic = apic();
        apic.enable_local(0);
        apic.route_legacy_pic();

        let lint0 = apic.regs().get(LAPIC_LVT_LINT0);
        assert_eq!(lint0 & LAPIC_LVT_MASKED, 0);
        assert_eq!(lint0 & 0x700, 0x700);
        assert_eq!(apic.regs().get(LAPIC_LVT_LINT1), 0x400);
    }

    #[test]
    fn icr_command_layout() {
        let cmd = IcrCommand::fixed(2, 0xF0);
        assert_eq!(cmd.low(), 0x40F0);
        assert_eq!(cmd.high(), 0x0200_0000);
        assert_eq!(cmd.destination(), 2);
        assert_eq!(cmd.vector(), 0xF0);
    }
}
