//! Boot-time glue for the interrupt core: the shared IDT, the entry stubs,
//! the AP trampoline and the init sequence the kernel calls.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod idt;
pub mod interrupts;
pub mod isr;
pub mod smp;
pub mod trampoline;

use kestrel_acpi::MadtPlatform;
use kestrel_acpi::tables::AcpiTables;
use kestrel_core::smp::BringUp;
use kestrel_drivers::IrqMode;
use kestrel_lib::cpu::enable_interrupts;
use kestrel_lib::{klog_info, klog_init};
use kestrel_mm::PhysAddr;
use kestrel_mm::paging::paging;

pub use interrupts::{
    exceptions_init, interrupt_config, interrupts_init_ap, interrupts_init_bsp, irqs_init,
};
pub use smp::smp_init;

/// Full boot-processor sequence: console, exceptions, controllers, then
/// interrupts on and the other processors started.
///
/// Without an RSDP the MADT is absent and the 8259 pair is used.
pub fn interrupt_core_init(cmdline: Option<&str>, rsdp: Option<PhysAddr>) -> (IrqMode, BringUp) {
    klog_init();
    kestrel_drivers::serial::init();

    let paging = paging();
    let platform = match rsdp.and_then(|rsdp| AcpiTables::from_rsdp(rsdp, paging)) {
        Some(tables) => MadtPlatform::from_tables(&tables),
        None => {
            klog_info!("BOOT: No ACPI tables found");
            MadtPlatform::absent()
        }
    };

    exceptions_init();
    let mode = interrupts_init_bsp(cmdline, &platform, paging);
    enable_interrupts();
    let smp = smp_init(&platform, paging);
    klog_info!("BOOT: Interrupt core up ({:?}, {:?})", mode, smp);
    (mode, smp)
}
