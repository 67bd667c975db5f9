//! ACPI table access for the interrupt core.
//!
//! Only what interrupt routing needs: RSDP/XSDT/RSDT traversal, the MADT,
//! and the [`platform::PlatformTables`] seam the controller drivers consume.
//!
//! - [`tables`]: RSDP validation, XSDT/RSDT traversal, table lookup by signature.
//! - [`madt`]: MADT (Multiple APIC Description Table) entry iteration.
//! - [`platform`]: typed entry search with a resumable cursor.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod madt;
pub mod platform;
pub mod tables;

pub use madt::{InterruptOverride, IoapicInfo, LocalApicInfo, Madt, MadtEntry, Polarity, TriggerMode};
pub use platform::{InterruptMode, MadtPlatform, PlatformTables, SearchCursor};
