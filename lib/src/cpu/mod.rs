pub mod core;
pub mod cpuid;
pub mod interrupts;
pub mod msr;

pub use self::core::*;
pub use cpuid::*;
pub use interrupts::*;
pub use msr::*;
