//! Architecture-neutral half of the interrupt core: handler registries,
//! dispatch policy and the multiprocessor bring-up sequencer.
//!
//! Hardware specifics live in `kestrel-drivers`; this crate only sees them
//! through [`controller::InterruptController`] and [`smp::ApControl`], which
//! keeps the one-way dependency drivers -> core.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod controller;
pub mod exception;
pub mod irq;
pub mod smp;
pub mod timer;

pub use config::{InterruptConfig, config_from_cmdline};
pub use controller::{InterruptController, active_controller, set_active_controller};
pub use irq::{IrqHandler, IrqReturn};
