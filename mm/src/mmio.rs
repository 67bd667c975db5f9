use core::ptr::{read_volatile, write_volatile};

use x86_64::{PhysAddr, VirtAddr};

use crate::paging::{DevicePaging, PagingError};

/// 32-bit register window: Local APIC page, I/O APIC select/data pair.
///
/// Drivers are generic over this so register sequencing can be checked
/// against a recording fake.
pub trait RegisterBus {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    virt_base: u64,
    phys_base: u64,
    size: usize,
}

impl MmioRegion {
    pub fn map(
        paging: &dyn DevicePaging,
        phys: PhysAddr,
        size: usize,
    ) -> Result<Self, PagingError> {
        if phys.is_null() || size == 0 {
            return Err(PagingError::InvalidRange);
        }
        let virt = paging.map_device(phys, size)?;
        Ok(Self {
            virt_base: virt.as_u64(),
            phys_base: phys.as_u64(),
            size,
        })
    }

    /// Wrap an already mapped window.
    ///
    /// # Safety
    ///
    /// `virt` must stay mapped to device memory for `size` bytes for as long
    /// as the region is used.
    pub const unsafe fn from_raw(virt: u64, phys: u64, size: usize) -> Self {
        Self {
            virt_base: virt,
            phys_base: phys,
            size,
        }
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "MMIO read out of bounds: offset={}, region_size={}",
            offset,
            self.size
        );
        let ptr = (self.virt_base + offset as u64) as *const u32;
        // SAFETY: the window was mapped for `size` bytes at construction.
        unsafe { read_volatile(ptr) }
    }

    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        debug_assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "MMIO write out of bounds: offset={}, region_size={}",
            offset,
            self.size
        );
        let ptr = (self.virt_base + offset as u64) as *mut u32;
        // SAFETY: as for `read_u32`.
        unsafe { write_volatile(ptr, value) }
    }

    #[inline]
    pub fn virt_base(&self) -> VirtAddr {
        VirtAddr::new(self.virt_base)
    }

    #[inline]
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr::new(self.phys_base)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl RegisterBus for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        self.read_u32(offset)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        self.write_u32(offset, value)
    }
}

// SAFETY: the region is plain addresses; device registers tolerate access
// from any CPU and callers serialize multi-step protocols themselves.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::HhdmPaging;

    #[test]
    fn volatile_access_hits_the_backing_memory() {
        let mut backing = [0u32; 4];
        let base = backing.as_mut_ptr() as u64;
        let region = unsafe { MmioRegion::from_raw(base, 0xFEE0_0000, 16) };
        region.write32(8, 0xDEAD_BEEF);
        assert_eq!(region.read32(8), 0xDEAD_BEEF);
        assert_eq!(backing[2], 0xDEAD_BEEF);
    }

    #[test]
    fn map_rejects_null_base() {
        let paging = HhdmPaging::new(Some(0), 0);
        assert_eq!(
            MmioRegion::map(&paging, PhysAddr::new(0), 0x1000).err(),
            Some(PagingError::InvalidRange)
        );
    }
}
