use core::mem;
use core::ptr::read_unaligned;

use kestrel_lib::{kfatal, klog_debug, klog_info};
use kestrel_mm::{DevicePaging, PagingError};
use x86_64::PhysAddr;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
/// ACPI 1.0 RSDP length covered by the first checksum.
const RSDP_V1_LEN: usize = 20;
pub const SDT_HEADER_LEN: usize = mem::size_of::<SdtHeader>();

const _: () = {
    assert!(mem::size_of::<Rsdp>() == 36);
    assert!(SDT_HEADER_LEN == 36);
};

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Read the header at the start of `bytes`, if long enough.
pub fn read_header(bytes: &[u8]) -> Option<SdtHeader> {
    if bytes.len() < SDT_HEADER_LEN {
        return None;
    }
    // SAFETY: length checked above; the struct is packed so any alignment works.
    Some(unsafe { read_unaligned(bytes.as_ptr() as *const SdtHeader) })
}

fn validate_table(bytes: &[u8]) -> bool {
    match read_header(bytes) {
        Some(hdr) => hdr.length as usize == bytes.len() && checksum(bytes) == 0,
        None => false,
    }
}

/// Validated handle to the ACPI table hierarchy rooted at an RSDP.
pub struct AcpiTables<'p> {
    rsdp: Rsdp,
    paging: &'p dyn DevicePaging,
}

impl<'p> AcpiTables<'p> {
    /// Validate the RSDP at `rsdp_phys` and return a handle for table
    /// lookups.
    pub fn from_rsdp(rsdp_phys: PhysAddr, paging: &'p dyn DevicePaging) -> Option<Self> {
        let bytes = map_bytes(paging, rsdp_phys.as_u64(), mem::size_of::<Rsdp>())?;
        // SAFETY: `bytes` covers a full `Rsdp`.
        let rsdp = unsafe { read_unaligned(bytes.as_ptr() as *const Rsdp) };
        if rsdp.signature != *RSDP_SIGNATURE {
            klog_info!("ACPI: RSDP signature mismatch");
            return None;
        }
        if checksum(&bytes[..RSDP_V1_LEN]) != 0 {
            klog_info!("ACPI: RSDP checksum failed");
            return None;
        }
        if rsdp.revision >= 2 && checksum(bytes) != 0 {
            klog_info!("ACPI: RSDP extended checksum failed");
            return None;
        }
        Some(Self { rsdp, paging })
    }

    /// Map a whole table: header first to learn its length, then the body.
    fn map_table(&self, phys: u64) -> Option<&'static [u8]> {
        if phys == 0 {
            return None;
        }
        let header = read_header(map_bytes(self.paging, phys, SDT_HEADER_LEN)?)?;
        let length = header.length as usize;
        if length < SDT_HEADER_LEN {
            return None;
        }
        map_bytes(self.paging, phys, length)
    }

    fn scan_sdt(&self, sdt: &[u8], entry_size: usize, signature: &[u8; 4]) -> Option<&'static [u8]> {
        let payload = &sdt[SDT_HEADER_LEN..];
        for entry in payload.chunks_exact(entry_size) {
            let phys = if entry_size == 8 {
                u64::from_le_bytes([
                    entry[0], entry[1], entry[2], entry[3], entry[4], entry[5], entry[6], entry[7],
                ])
            } else {
                u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) as u64
            };

            let Some(candidate) = self.map_table(phys) else {
                continue;
            };
            if candidate[..4] != signature[..] {
                continue;
            }
            if !validate_table(candidate) {
                klog_info!("ACPI: Found table with invalid checksum, skipping");
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// Find an ACPI table by its 4-byte ASCII signature.
    ///
    /// Searches XSDT first (64-bit entries), falls back to RSDT (32-bit entries).
    pub fn find_table(&self, signature: &[u8; 4]) -> Option<&'static [u8]> {
        let rsdp = self.rsdp;

        if rsdp.revision >= 2 && rsdp.xsdt_address != 0 {
            if let Some(xsdt) = self.map_table(rsdp.xsdt_address).filter(|t| validate_table(t)) {
                if let Some(hit) = self.scan_sdt(xsdt, mem::size_of::<u64>(), signature) {
                    return Some(hit);
                }
            }
        }

        if rsdp.rsdt_address != 0 {
            if let Some(rsdt) = self
                .map_table(rsdp.rsdt_address as u64)
                .filter(|t| validate_table(t))
            {
                if let Some(hit) = self.scan_sdt(rsdt, mem::size_of::<u32>(), signature) {
                    return Some(hit);
                }
            }
        }

        klog_debug!(
            "ACPI: table {} not found",
            core::str::from_utf8(signature).unwrap_or("????")
        );
        None
    }
}

/// Map `len` bytes of firmware memory. Running out of virtual address space
/// here is fatal; any other failure means the table is unusable.
fn map_bytes(paging: &dyn DevicePaging, phys: u64, len: usize) -> Option<&'static [u8]> {
    let phys = PhysAddr::try_new(phys).ok()?;
    match paging.map_device(phys, len) {
        // SAFETY: firmware tables stay mapped for the kernel's lifetime and
        // are never written by the OS.
        Ok(virt) => Some(unsafe { core::slice::from_raw_parts(virt.as_ptr::<u8>(), len) }),
        Err(PagingError::AddressSpaceExhausted) => kfatal!(
            "ACPI: out of virtual address space mapping table at 0x{:x} ({} bytes)",
            phys.as_u64(),
            len
        ),
        Err(err) => {
            klog_info!("ACPI: cannot map 0x{:x}: {:?}", phys.as_u64(), err);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::vec::Vec;

    use kestrel_mm::{DevicePaging, PagingError};
    use x86_64::{PhysAddr, VirtAddr};

    /// Physical memory backed by a host buffer starting at `phys_base`.
    pub struct FakeFirmware {
        pub memory: Vec<u8>,
        pub phys_base: u64,
        pub exhausted: bool,
    }

    impl FakeFirmware {
        pub fn new(phys_base: u64, size: usize) -> Self {
            Self {
                memory: std::vec![0; size],
                phys_base,
                exhausted: false,
            }
        }

        pub fn put(&mut self, phys: u64, bytes: &[u8]) {
            let off = (phys - self.phys_base) as usize;
            self.memory[off..off + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl DevicePaging for FakeFirmware {
        fn map_device(&self, phys: PhysAddr, len: usize) -> Result<VirtAddr, PagingError> {
            if self.exhausted {
                return Err(PagingError::AddressSpaceExhausted);
            }
            let off = phys
                .as_u64()
                .checked_sub(self.phys_base)
                .ok_or(PagingError::InvalidRange)? as usize;
            if off + len > self.memory.len() {
                return Err(PagingError::InvalidRange);
            }
            Ok(VirtAddr::from_ptr(self.memory[off..].as_ptr()))
        }

        fn identity_map(&self, _start: PhysAddr, _len: usize) -> Result<(), PagingError> {
            Ok(())
        }

        fn unmap(&self, _start: VirtAddr, _len: usize) -> Result<(), PagingError> {
            Ok(())
        }
    }

    /// Header + body with a correct checksum.
    pub fn sdt(signature: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let len = 36 + body.len();
        let mut t = Vec::with_capacity(len);
        t.extend_from_slice(signature);
        t.extend_from_slice(&(len as u32).to_le_bytes());
        t.push(1);
        t.push(0);
        t.extend_from_slice(b"KSTREL");
        t.extend_from_slice(b"KESTRELT");
        t.extend_from_slice(&[0; 12]);
        t.extend_from_slice(body);
        let sum = super::checksum(&t);
        t[9] = 0u8.wrapping_sub(sum);
        t
    }

    pub fn rsdp_v2(xsdt: u64) -> Vec<u8> {
        let mut r = Vec::with_capacity(36);
        r.extend_from_slice(b"RSD PTR ");
        r.push(0);
        r.extend_from_slice(b"KSTREL");
        r.push(2);
        r.extend_from_slice(&0u32.to_le_bytes());
        r.extend_from_slice(&36u32.to_le_bytes());
        r.extend_from_slice(&xsdt.to_le_bytes());
        r.push(0);
        r.extend_from_slice(&[0; 3]);
        let sum = super::checksum(&r[..20]);
        r[8] = 0u8.wrapping_sub(sum);
        let ext = super::checksum(&r);
        r[32] = 0u8.wrapping_sub(ext);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn firmware_with_apic_table() -> FakeFirmware {
        let mut fw = FakeFirmware::new(0xE0000, 0x2000);
        let madt = sdt(b"APIC", &[0x00, 0x00, 0xE0, 0xFE, 1, 0, 0, 0]);
        let facp = sdt(b"FACP", &[0; 8]);
        let mut xsdt_body = std::vec::Vec::new();
        xsdt_body.extend_from_slice(&0xE0200u64.to_le_bytes());
        xsdt_body.extend_from_slice(&0xE0100u64.to_le_bytes());
        fw.put(0xE0000, &rsdp_v2(0xE0040));
        fw.put(0xE0040, &sdt(b"XSDT", &xsdt_body));
        fw.put(0xE0100, &madt);
        fw.put(0xE0200, &facp);
        fw
    }

    #[test]
    fn finds_table_through_xsdt() {
        let fw = firmware_with_apic_table();
        let tables = AcpiTables::from_rsdp(PhysAddr::new(0xE0000), &fw).unwrap();
        let madt = tables.find_table(b"APIC").unwrap();
        assert_eq!(&madt[..4], b"APIC");
        assert_eq!(madt.len(), 44);
        assert!(tables.find_table(b"HPET").is_none());
    }

    #[test]
    fn corrupt_rsdp_is_rejected() {
        let mut fw = firmware_with_apic_table();
        fw.memory[8] ^= 0xFF;
        assert!(AcpiTables::from_rsdp(PhysAddr::new(0xE0000), &fw).is_none());
    }

    #[test]
    #[should_panic(expected = "out of virtual address space")]
    fn address_space_exhaustion_is_fatal() {
        let mut fw = firmware_with_apic_table();
        fw.exhausted = true;
        let _ = AcpiTables::from_rsdp(PhysAddr::new(0xE0000), &fw);
    }
}
