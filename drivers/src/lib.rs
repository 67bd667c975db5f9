//! Interrupt controller drivers: the 8259 pair, the I/O APIC, the Local
//! APIC and the PIT, plus the COM1 log backend.
//!
//! [`irq::irqs_init`] chooses between them at boot and publishes the result
//! to `kestrel_core` as the active controller.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod apic;
pub mod ioapic;
pub mod irq;
pub mod pic;
pub mod pit;
pub mod serial;

#[cfg(test)]
mod test_support;

pub use irq::{IrqMode, irq_mode, irqs_init, irqs_init_ap};
