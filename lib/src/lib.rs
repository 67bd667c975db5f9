#![no_std]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod cpu;
pub mod fatal;
pub mod init_once;
pub mod io;
pub mod kdiag;
pub mod klog;
pub mod pcr;
pub mod spin_wait;

pub use fatal::fatal;
pub use init_once::{AlreadyInitialized, InitOnce};
pub use io::{HwPorts, PortBus};
pub use kdiag::{InterruptFrame, kdiag_dump_interrupt_frame};
pub use klog::{KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level};
pub use pcr::{MAX_CPUS, current_apic_id, register_lapic_id_fn};
pub use spin_wait::{SpinPolicy, SpinTimeout};
