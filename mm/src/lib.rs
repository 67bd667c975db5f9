#![no_std]

#[cfg(test)]
extern crate std;

pub mod hhdm;
pub mod mmio;
pub mod paging;

pub use mmio::{MmioRegion, RegisterBus};
pub use paging::{DevicePaging, HhdmPaging, PagingError};
pub use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE_4KB: u64 = 0x1000;
