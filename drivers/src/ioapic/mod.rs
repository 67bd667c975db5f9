pub mod regs;

use spin::Mutex;

use kestrel_acpi::madt::{
    IOAPIC_ENTRY_LEN, ISO_ENTRY_LEN, MADT_ENTRY_INTERRUPT_OVERRIDE, MADT_ENTRY_IOAPIC,
};
use kestrel_acpi::{
    InterruptOverride, IoapicInfo, MadtEntry, Polarity, PlatformTables, SearchCursor, TriggerMode,
};
use kestrel_lib::init_once::InitError;
use kestrel_lib::{InitOnce, current_apic_id, kfatal, klog_debug, klog_info, klog_warn};
use kestrel_mm::{DevicePaging, MmioRegion, PagingError, PhysAddr, RegisterBus};

pub use regs::{
    DeliveryMode, EntryPolarity, EntryTrigger, IOAPIC_MAX_PINS, ISA_IRQ_COUNT, RedirectionEntry,
    RedirectionFlags,
};
use regs::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoApicError {
    /// The platform describes no APIC topology.
    NoTables,
    /// No I/O APIC entry in the MADT.
    NoController,
    Map(PagingError),
    /// The GSI is not served by this controller.
    GsiOutOfRange(u32),
    AlreadyInitialized,
}

impl From<PagingError> for IoApicError {
    fn from(err: PagingError) -> Self {
        Self::Map(err)
    }
}

/// ISA IRQ retargeted by an interrupt source override.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Override {
    pub gsi: u32,
    pub polarity: EntryPolarity,
    pub trigger: EntryTrigger,
}

impl Override {
    /// ISA defaults apply where the MADT says "conforms to bus".
    fn from_madt(ov: &InterruptOverride) -> Self {
        let polarity = match ov.polarity() {
            Polarity::ActiveLow => EntryPolarity::ActiveLow,
            Polarity::ActiveHigh | Polarity::BusDefault => EntryPolarity::ActiveHigh,
        };
        let trigger = match ov.trigger_mode() {
            TriggerMode::Level => EntryTrigger::Level,
            TriggerMode::Edge | TriggerMode::BusDefault => EntryTrigger::Edge,
        };
        Self {
            gsi: ov.gsi,
            polarity,
            trigger,
        }
    }
}

/// One I/O APIC behind a select/data register window.
pub struct IoApic<R: RegisterBus> {
    /// Select and data writes must pair up; one lock per controller.
    regs: Mutex<R>,
    id: u8,
    phys_addr: u32,
    gsi_base: u32,
    version: u32,
    max_redirection: u32,
    overrides: [Option<Override>; ISA_IRQ_COUNT],
    destination: u8,
}

fn read_reg<R: RegisterBus>(regs: &R, reg: u8) -> u32 {
    regs.write32(IOAPIC_IOREGSEL, reg as u32);
    regs.read32(IOAPIC_IOWIN)
}

fn write_reg<R: RegisterBus>(regs: &R, reg: u8, value: u32) {
    regs.write32(IOAPIC_IOREGSEL, reg as u32);
    regs.write32(IOAPIC_IOWIN, value);
}

impl<R: RegisterBus> IoApic<R> {
    /// Find the first I/O APIC, map it with `map`, mask every redirection
    /// entry and collect the ISA source overrides.
    ///
    /// Unmasked interrupts are routed to `destination`.
    pub fn probe(
        platform: &dyn PlatformTables,
        destination: u8,
        map: impl FnOnce(&IoapicInfo) -> Result<R, IoApicError>,
    ) -> Result<Self, IoApicError> {
        if !platform.supported() {
            return Err(IoApicError::NoTables);
        }

        let mut cursor = SearchCursor::START;
        let info = match platform.search_entries(MADT_ENTRY_IOAPIC, IOAPIC_ENTRY_LEN, &mut cursor)
        {
            Some(MadtEntry::Ioapic(info)) => info,
            _ => {
                klog_info!("IOAPIC: No controller described by firmware");
                return Err(IoApicError::NoController);
            }
        };

        let regs = map(&info)?;
        let version = read_reg(&regs, IOAPIC_REG_VER);
        let reported = ((version >> 16) & 0xFF) + 1;
        if reported > IOAPIC_MAX_PINS {
            klog_warn!(
                "IOAPIC: Version reports {} entries, using {}",
                reported,
                IOAPIC_MAX_PINS
            );
        }
        let mut ioapic = Self {
            regs: Mutex::new(regs),
            id: info.id,
            phys_addr: info.address,
            gsi_base: info.gsi_base,
            version,
            max_redirection: max_redirection_from_version(version),
            overrides: [None; ISA_IRQ_COUNT],
            destination,
        };

        ioapic.mask_all();
        ioapic.scan_overrides(platform);

        klog_info!(
            "IOAPIC: ID 0x{:x} @ phys 0x{:x}, GSIs {}-{}, version 0x{:x}",
            ioapic.id,
            ioapic.phys_addr,
            ioapic.gsi_base,
            ioapic.gsi_base + ioapic.max_redirection - 1,
            ioapic.version & 0xFF
        );
        Ok(ioapic)
    }

    fn mask_all(&self) {
        for pin in 0..self.max_redirection {
            self.write_pin(pin, RedirectionEntry::MASKED);
        }
    }

    fn scan_overrides(&mut self, platform: &dyn PlatformTables) {
        let mut cursor = SearchCursor::START;
        while let Some(entry) =
            platform.search_entries(MADT_ENTRY_INTERRUPT_OVERRIDE, ISO_ENTRY_LEN, &mut cursor)
        {
            let MadtEntry::InterruptOverride(ov) = entry else {
                continue;
            };
            // Only ISA sources are remapped; bus 0 is ISA.
            if ov.bus_source != 0 || ov.irq_source as usize >= ISA_IRQ_COUNT {
                continue;
            }
            let mapped = Override::from_madt(&ov);
            klog_debug!(
                "IOAPIC: ISO IRQ {} -> GSI {}, {:?} {:?}",
                ov.irq_source,
                mapped.gsi,
                mapped.polarity,
                mapped.trigger
            );
            self.overrides[ov.irq_source as usize] = Some(mapped);
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn max_redirection(&self) -> u32 {
        self.max_redirection
    }

    pub fn destination(&self) -> u8 {
        self.destination
    }

    pub fn override_for(&self, irq: u8) -> Option<Override> {
        self.overrides.get(irq as usize).copied().flatten()
    }

    /// GSI that ISA `irq` arrives on: the override target, else identity.
    pub fn remap_interrupt(&self, irq: u8) -> u32 {
        self.override_for(irq)
            .map_or(irq as u32, |ov| ov.gsi)
    }

    fn pin_for_gsi(&self, gsi: u32) -> Result<u32, IoApicError> {
        gsi.checked_sub(self.gsi_base)
            .filter(|pin| *pin < self.max_redirection)
            .ok_or(IoApicError::GsiOutOfRange(gsi))
    }

    fn write_pin(&self, pin: u32, entry: RedirectionEntry) {
        let regs = self.regs.lock();
        // High half first: the mask bit lives in the low half.
        write_reg(&*regs, redir_high_index(pin), entry.high());
        write_reg(&*regs, redir_low_index(pin), entry.low());
    }

    pub fn read_entry(&self, pin: u32) -> Result<RedirectionEntry, IoApicError> {
        if pin >= self.max_redirection {
            return Err(IoApicError::GsiOutOfRange(self.gsi_base + pin));
        }
        let regs = self.regs.lock();
        let low = read_reg(&*regs, redir_low_index(pin));
        let high = read_reg(&*regs, redir_high_index(pin));
        Ok(RedirectionEntry::from_halves(low, high))
    }

    pub fn write_entry(&self, pin: u32, entry: RedirectionEntry) -> Result<(), IoApicError> {
        if pin >= self.max_redirection {
            return Err(IoApicError::GsiOutOfRange(self.gsi_base + pin));
        }
        self.write_pin(pin, entry);
        Ok(())
    }

    /// Route ISA `irq` to `vector` on the boot processor and unmask it.
    pub fn enable_interrupt(&self, irq: u8, vector: u8) -> Result<(), IoApicError> {
        let gsi = self.remap_interrupt(irq);
        let pin = self.pin_for_gsi(gsi)?;
        let mut entry = RedirectionEntry::fixed(vector, self.destination)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_logical(false);
        if let Some(ov) = self.override_for(irq) {
            entry = entry.with_polarity(ov.polarity).with_trigger(ov.trigger);
        }
        self.write_pin(pin, entry);
        klog_debug!(
            "IOAPIC: IRQ {} -> GSI {} -> vector 0x{:x}, APIC {}",
            irq,
            gsi,
            vector,
            self.destination
        );
        Ok(())
    }

    /// Mask ISA `irq`, keeping the rest of its routing.
    pub fn disable_interrupt(&self, irq: u8) -> Result<(), IoApicError> {
        let pin = self.pin_for_gsi(self.remap_interrupt(irq))?;
        let entry = self.read_entry(pin)?;
        self.write_pin(pin, entry.with_masked(true));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn regs(&self) -> spin::MutexGuard<'_, R> {
        self.regs.lock()
    }
}

/// Claim `slot` with a probe result. A claimed slot reports
/// [`IoApicError::AlreadyInitialized`].
pub fn init_once<'a, R: RegisterBus>(
    slot: &'a InitOnce<IoApic<R>>,
    probe: impl FnOnce() -> Result<IoApic<R>, IoApicError>,
) -> Result<&'a IoApic<R>, IoApicError> {
    slot.try_init(probe).map_err(|err| match err {
        InitError::AlreadyInitialized => IoApicError::AlreadyInitialized,
        InitError::Failed(err) => err,
    })
}

fn map_window(paging: &dyn DevicePaging, info: &IoapicInfo) -> Result<MmioRegion, IoApicError> {
    Ok(MmioRegion::map(
        paging,
        PhysAddr::new(info.address as u64),
        IOAPIC_REGION_SIZE,
    )?)
}

static IOAPIC: InitOnce<IoApic<MmioRegion>> = InitOnce::new();

/// Bring up the system I/O APIC. Routes go to the calling processor.
///
/// Running it twice is a boot-sequence bug and halts.
pub fn ioapic_init(
    platform: &dyn PlatformTables,
    paging: &dyn DevicePaging,
) -> Result<&'static IoApic<MmioRegion>, IoApicError> {
    klog_debug!("IOAPIC: Initializing...");
    let bsp = current_apic_id() as u8;
    match init_once(&IOAPIC, || {
        IoApic::probe(platform, bsp, |info| map_window(paging, info))
    }) {
        Err(IoApicError::AlreadyInitialized) => kfatal!("IOAPIC: ioapic_init called twice"),
        Err(err) => {
            klog_info!("IOAPIC: Initialization failed: {:?}", err);
            Err(err)
        }
        Ok(ioapic) => {
            klog_debug!("IOAPIC: Initialized");
            Ok(ioapic)
        }
    }
}

#[inline]
pub fn ioapic() -> Option<&'static IoApic<MmioRegion>> {
    IOAPIC.get()
}

pub fn is_ready() -> bool {
    IOAPIC.is_ready()
}
