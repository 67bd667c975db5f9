use alloc::vec::Vec;

use x86_64::instructions::tables::sgdt;
use x86_64::registers::control::Cr3;

use kestrel_acpi::madt::{LOCAL_APIC_ENTRY_LEN, MADT_ENTRY_LOCAL_APIC};
use kestrel_acpi::{MadtEntry, PlatformTables, SearchCursor};
use kestrel_core::smp::{
    ApControl, BringUp, BringUpConfig, ProcessorDescriptor, SmpError, bring_up, processors,
};
use kestrel_drivers::apic::{self, IpiError, LocalApic};
use kestrel_drivers::pit::pit_poll_delay_ms;
use kestrel_lib::cpu::{enable_interrupts, hlt};
use kestrel_lib::{SpinPolicy, current_apic_id, kfatal, klog_info, klog_warn};
use kestrel_mm::{DevicePaging, RegisterBus};

use crate::interrupts::{interrupt_config, interrupts_init_ap};
use crate::trampoline::{self, TRAMPOLINE_START_PAGE, TrampolineParams, TrampolinePage};

pub const AP_STACK_SIZE: usize = 16 * 1024;

/// APIC ids of every enabled or online-capable processor in the MADT.
pub fn usable_apic_ids(platform: &dyn PlatformTables) -> impl Iterator<Item = u32> + '_ {
    let mut cursor = SearchCursor::default();
    core::iter::from_fn(move || {
        platform.search_entries(MADT_ENTRY_LOCAL_APIC, LOCAL_APIC_ENTRY_LEN, &mut cursor)
    })
    .filter_map(|entry| match entry {
        MadtEntry::LocalApic(info) if info.is_usable() => Some(info.apic_id as u32),
        _ => None,
    })
}

fn ipi_error(err: IpiError) -> SmpError {
    match err {
        IpiError::Timeout { apic_id } => SmpError::IpiTimeout {
            apic_id: apic_id as u32,
        },
    }
}

/// Boot-processor half of AP start-up on real hardware.
pub struct HwApControl<'a, R: RegisterBus> {
    lapic: &'a LocalApic<R>,
    page: &'a TrampolinePage,
    ipi: SpinPolicy,
    /// Everything but the per-processor fields.
    template: TrampolineParams,
}

impl<'a, R: RegisterBus> HwApControl<'a, R> {
    pub fn new(
        lapic: &'a LocalApic<R>,
        page: &'a TrampolinePage,
        ipi: SpinPolicy,
        template: TrampolineParams,
    ) -> Self {
        Self {
            lapic,
            page,
            ipi,
            template,
        }
    }

    fn apic_id(apic_id: u32) -> Result<u8, SmpError> {
        u8::try_from(apic_id).map_err(|_| SmpError::IpiTimeout { apic_id })
    }
}

fn allocate_stack() -> Result<u64, SmpError> {
    let mut stack: Vec<u8> = Vec::new();
    stack
        .try_reserve_exact(AP_STACK_SIZE)
        .map_err(|_| SmpError::OutOfMemory)?;
    stack.resize(AP_STACK_SIZE, 0);
    let stack = stack.leak();
    let top = stack.as_ptr() as u64 + AP_STACK_SIZE as u64;
    Ok(top & !0xF)
}

impl<R: RegisterBus> ApControl for HwApControl<'_, R> {
    fn prepare(&mut self, cpu: &ProcessorDescriptor) -> Result<(), SmpError> {
        let params = TrampolineParams {
            stack_top: allocate_stack()?,
            cpu_index: cpu.index() as u64,
            ..self.template
        };
        self.page.write_params(&params);
        Ok(())
    }

    fn send_init(&mut self, apic_id: u32) -> Result<(), SmpError> {
        self.lapic
            .send_init(Self::apic_id(apic_id)?, self.ipi)
            .map_err(ipi_error)
    }

    fn send_startup(&mut self, apic_id: u32, start_page: u8) -> Result<(), SmpError> {
        self.lapic
            .send_startup(Self::apic_id(apic_id)?, start_page, self.ipi)
            .map_err(ipi_error)
    }

    fn delay_us(&mut self, us: u32) {
        pit_poll_delay_ms(us.div_ceil(1000));
    }
}

extern "C" fn ap_entry(cpu_index: u64) -> ! {
    let cpu_index = cpu_index as usize;
    interrupts_init_ap(cpu_index);
    if let Some(cpu) = processors().get(cpu_index) {
        cpu.mark_started();
    }
    klog_info!(
        "MP: CPU online (idx {}, apic 0x{:x})",
        cpu_index,
        current_apic_id()
    );
    enable_interrupts();
    loop {
        hlt();
    }
}

fn params_template() -> TrampolineParams {
    let (frame, _) = Cr3::read();
    let cr3 = frame.start_address().as_u64();
    if let Err(err) = trampoline::check_cr3(cr3) {
        kfatal!("MP: Trampoline cannot reach the page tables: {:?}", err);
    }
    let gdtr = sgdt();
    TrampolineParams {
        cr3,
        stack_top: 0,
        entry: ap_entry as usize as u64,
        cpu_index: 0,
        gdt_limit: gdtr.limit,
        gdt_base: gdtr.base.as_u64(),
    }
}

/// Discover the processors in the MADT and start every AP.
///
/// Runs once on the boot processor after interrupts are fully set up.
pub fn smp_init(platform: &dyn PlatformTables, paging: &dyn DevicePaging) -> BringUp {
    let cfg = interrupt_config();
    if !cfg.smp {
        klog_info!("MP: Disabled on the command line");
        return BringUp::SingleProcessor;
    }
    let Some(lapic) = apic::lapic() else {
        klog_info!("MP: No Local APIC; skipping AP startup");
        return BringUp::SingleProcessor;
    };

    let table = processors();
    let bsp = current_apic_id();
    let count = table.discover(bsp, usable_apic_ids(platform));
    klog_info!("MP: discovered {} CPUs, BSP LAPIC 0x{:x}", count, bsp);
    if count < 2 {
        klog_info!("MP: no secondary CPUs to start");
        return BringUp::SingleProcessor;
    }

    let page = match trampoline::install(paging) {
        Ok(page) => page,
        Err(err @ SmpError::TrampolineTooLarge { .. }) => {
            kfatal!("MP: {:?}", err);
        }
        Err(err) => {
            klog_warn!("MP: AP startup skipped: {:?}", err);
            return BringUp::SingleProcessor;
        }
    };

    let mut ctl = HwApControl::new(
        lapic,
        &page,
        SpinPolicy::new(cfg.ipi_spins),
        params_template(),
    );
    let bring_cfg = BringUpConfig {
        start_page: TRAMPOLINE_START_PAGE,
        startup_wait: SpinPolicy::new(cfg.smp_spins),
        ..BringUpConfig::default()
    };
    let outcome = bring_up(table, &mut ctl, &bring_cfg);

    if let Err(err) = table.ensure_quiescent() {
        kfatal!("MP: Trampoline still in use: {:?}", err);
    }
    trampoline::remove(page, paging);
    outcome
}

#[cfg(test)]
mod tests {
    use std::vec;
    use std::vec::Vec;

    use kestrel_acpi::{InterruptMode, IoapicInfo, LocalApicInfo};

    use super::*;

    struct Entries(Vec<MadtEntry>);

    impl PlatformTables for Entries {
        fn supported(&self) -> bool {
            true
        }

        fn search_entries(
            &self,
            entry_type: u8,
            _min_length: usize,
            cursor: &mut SearchCursor,
        ) -> Option<MadtEntry> {
            let base = SearchCursor::START.offset();
            let start = cursor.offset().checked_sub(base)?;
            let (index, entry) = self
                .0
                .iter()
                .enumerate()
                .skip(start)
                .find(|(_, e)| e.entry_type() == entry_type)?;
            *cursor = SearchCursor::at(base + index + 1);
            Some(*entry)
        }

        fn change_interrupt_mode(&self, _mode: InterruptMode) -> bool {
            true
        }
    }

    fn cpu(apic_id: u8, flags: u32) -> MadtEntry {
        MadtEntry::LocalApic(LocalApicInfo {
            processor_id: apic_id,
            apic_id,
            flags,
        })
    }

    #[test]
    fn only_usable_processors_are_listed() {
        let platform = Entries(vec![
            cpu(0, 1),
            MadtEntry::Ioapic(IoapicInfo {
                id: 0,
                address: 0xFEC0_0000,
                gsi_base: 0,
            }),
            cpu(2, 0),
            cpu(4, 2),
            cpu(6, 1),
        ]);
        let ids: Vec<u32> = usable_apic_ids(&platform).collect();
        assert_eq!(ids, [0, 4, 6]);
    }

    #[test]
    fn ipi_timeout_maps_to_the_target() {
        assert_eq!(
            ipi_error(IpiError::Timeout { apic_id: 7 }),
            SmpError::IpiTimeout { apic_id: 7 }
        );
    }

    #[test]
    fn stacks_are_aligned() {
        let top = allocate_stack().unwrap();
        assert_eq!(top % 16, 0);
    }
}
