//! Boot entry points for the interrupt core.
//!
//! Order on the boot processor: [`exceptions_init`], then
//! [`interrupts_init_bsp`], then `smp_init`. Each AP runs
//! [`interrupts_init_ap`] from its trampoline entry.

use kestrel_acpi::PlatformTables;
use kestrel_core::{InterruptConfig, config_from_cmdline};
use kestrel_drivers::IrqMode;
use kestrel_lib::arch::idt::{
    EXCEPTION_BREAKPOINT, EXCEPTION_OVERFLOW, EXCEPTION_VECTORS, IRQ_BASE_VECTOR,
};
use kestrel_lib::{InitOnce, kfatal, klog_debug, klog_set_level};
use kestrel_mm::DevicePaging;

use crate::idt::idt;
use crate::isr::stub_address;

static CONFIG: InitOnce<InterruptConfig> = InitOnce::new();

/// Configuration parsed by [`interrupts_init_bsp`], or the defaults before
/// it ran.
pub fn interrupt_config() -> InterruptConfig {
    CONFIG.get().copied().unwrap_or_default()
}

/// Build the table, open vectors 0-31 and load it on the boot processor.
pub fn exceptions_init() {
    klog_debug!("IDT: Initializing...");
    let idt = idt();
    for vector in 0..EXCEPTION_VECTORS as u8 {
        let target = stub_address(vector);
        if vector == EXCEPTION_BREAKPOINT || vector == EXCEPTION_OVERFLOW {
            idt.open_trap_gate(vector, target);
        } else {
            idt.open_interrupt_gate(vector, target);
        }
    }
    idt.load();
    klog_debug!("IDT: Initialized");
}

/// Parse the command line, open the IRQ vectors and program whichever
/// controller the platform supports.
pub fn interrupts_init_bsp(
    cmdline: Option<&str>,
    platform: &dyn PlatformTables,
    paging: &dyn DevicePaging,
) -> IrqMode {
    let cfg = config_from_cmdline(cmdline);
    klog_set_level(cfg.log_level);
    if CONFIG.init(|| cfg).is_err() {
        kfatal!("IRQ: interrupts_init_bsp called twice");
    }

    let idt = idt();
    for vector in IRQ_BASE_VECTOR..=u8::MAX {
        idt.open_interrupt_gate(vector, stub_address(vector));
    }

    kestrel_drivers::irqs_init(&cfg, platform, paging)
}

pub use self::interrupts_init_bsp as irqs_init;

/// Per-AP half: the shared table and the processor's own Local APIC.
pub fn interrupts_init_ap(cpu_index: usize) {
    idt().load();
    kestrel_drivers::irqs_init_ap(cpu_index, &interrupt_config());
}
