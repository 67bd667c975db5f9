//! Paging collaborator seam.
//!
//! The interrupt core never walks page tables. It asks a [`DevicePaging`]
//! implementation to make controller registers reachable and to provide the
//! identity-mapped low-memory window used by the AP trampoline. The kernel
//! installs its own implementation with [`register_paging`]; [`HhdmPaging`]
//! serves the common case of a bootloader-provided direct map plus an
//! identity-mapped low region.

use spin::Once;
use x86_64::{PhysAddr, VirtAddr};

use crate::hhdm;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingError {
    /// No virtual range left for a new mapping.
    AddressSpaceExhausted,
    /// Zero length, overflow, or a null base.
    InvalidRange,
    /// The range is not (and cannot be made) identity mapped.
    NotIdentityMapped,
}

pub trait DevicePaging: Sync {
    /// Map `len` bytes of device memory uncached and return their virtual
    /// address.
    fn map_device(&self, phys: PhysAddr, len: usize) -> Result<VirtAddr, PagingError>;

    /// Make `[start, start + len)` reachable at the same virtual address.
    /// Implementations backed by a permanent boot window may only verify
    /// that the range is already covered.
    fn identity_map(&self, start: PhysAddr, len: usize) -> Result<(), PagingError>;

    /// Remove a mapping created by `identity_map`.
    fn unmap(&self, start: VirtAddr, len: usize) -> Result<(), PagingError>;
}

fn checked_end(start: u64, len: usize) -> Result<u64, PagingError> {
    if len == 0 {
        return Err(PagingError::InvalidRange);
    }
    start
        .checked_add(len as u64)
        .ok_or(PagingError::InvalidRange)
}

/// Direct-map translation with a fixed identity window starting at 0.
#[derive(Clone, Copy, Debug)]
pub struct HhdmPaging {
    offset: Option<u64>,
    identity_limit: u64,
}

impl HhdmPaging {
    /// Low 1 MiB, where the trampoline page lives; identity mapped by the
    /// bootloaders this kernel supports.
    pub const DEFAULT_IDENTITY_LIMIT: u64 = 0x10_0000;

    pub const fn new(offset: Option<u64>, identity_limit: u64) -> Self {
        Self {
            offset,
            identity_limit,
        }
    }

    /// Use the offset recorded by [`hhdm::init`].
    pub fn from_boot() -> Self {
        Self::new(hhdm::try_offset(), Self::DEFAULT_IDENTITY_LIMIT)
    }
}

/// Nothing is ever mapped here. `map_device` translates through the
/// direct map, and `identity_map`/`unmap` only check that the range lies
/// inside the identity window the bootloader left in place below
/// `identity_limit`.
impl DevicePaging for HhdmPaging {
    fn map_device(&self, phys: PhysAddr, len: usize) -> Result<VirtAddr, PagingError> {
        if phys.is_null() {
            return Err(PagingError::InvalidRange);
        }
        checked_end(phys.as_u64(), len)?;
        let offset = self.offset.ok_or(PagingError::AddressSpaceExhausted)?;
        hhdm::translate(offset, phys).ok_or(PagingError::AddressSpaceExhausted)
    }

    fn identity_map(&self, start: PhysAddr, len: usize) -> Result<(), PagingError> {
        let end = checked_end(start.as_u64(), len)?;
        if end > self.identity_limit {
            return Err(PagingError::NotIdentityMapped);
        }
        Ok(())
    }

    fn unmap(&self, start: VirtAddr, len: usize) -> Result<(), PagingError> {
        // The boot identity window is permanent; nothing to tear down inside it.
        let end = checked_end(start.as_u64(), len)?;
        if end > self.identity_limit {
            return Err(PagingError::NotIdentityMapped);
        }
        Ok(())
    }
}

static PAGING: Once<&'static dyn DevicePaging> = Once::new();
static BOOT_PAGING: Once<HhdmPaging> = Once::new();

/// Install the kernel's paging implementation. Later calls are ignored.
pub fn register_paging(paging: &'static dyn DevicePaging) {
    PAGING.call_once(|| paging);
}

/// The registered implementation, or [`HhdmPaging::from_boot`].
pub fn paging() -> &'static dyn DevicePaging {
    if let Some(paging) = PAGING.get() {
        return *paging;
    }
    BOOT_PAGING.call_once(HhdmPaging::from_boot)
}
