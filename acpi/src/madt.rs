use core::mem;
use core::ptr::read_unaligned;

use kestrel_lib::klog_info;

use crate::tables::{AcpiTables, SdtHeader};

pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";
pub const MADT_ENTRY_LOCAL_APIC: u8 = 0;
pub const MADT_ENTRY_IOAPIC: u8 = 1;
pub const MADT_ENTRY_INTERRUPT_OVERRIDE: u8 = 2;

/// MADT flags bit 0: the platform also has dual 8259s that must be masked
/// before switching to APIC mode.
pub const MADT_FLAG_PCAT_COMPAT: u32 = 1 << 0;

const LAPIC_FLAG_ENABLED: u32 = 1 << 0;
const LAPIC_FLAG_ONLINE_CAPABLE: u32 = 1 << 1;

#[repr(C, packed)]
struct RawMadt {
    header: SdtHeader,
    lapic_address: u32,
    flags: u32,
}

#[repr(C, packed)]
struct RawEntryHeader {
    entry_type: u8,
    length: u8,
}

#[repr(C, packed)]
struct RawLocalApicEntry {
    header: RawEntryHeader,
    processor_id: u8,
    apic_id: u8,
    flags: u32,
}

#[repr(C, packed)]
struct RawIoapicEntry {
    header: RawEntryHeader,
    ioapic_id: u8,
    reserved: u8,
    ioapic_address: u32,
    gsi_base: u32,
}

#[repr(C, packed)]
struct RawIsoEntry {
    header: RawEntryHeader,
    bus_source: u8,
    irq_source: u8,
    gsi: u32,
    flags: u16,
}

pub const MADT_ENTRIES_OFFSET: usize = mem::size_of::<RawMadt>();
pub const LOCAL_APIC_ENTRY_LEN: usize = mem::size_of::<RawLocalApicEntry>();
pub const IOAPIC_ENTRY_LEN: usize = mem::size_of::<RawIoapicEntry>();
pub const ISO_ENTRY_LEN: usize = mem::size_of::<RawIsoEntry>();

const _: () = {
    assert!(MADT_ENTRIES_OFFSET == 44);
    assert!(LOCAL_APIC_ENTRY_LEN == 8);
    assert!(IOAPIC_ENTRY_LEN == 12);
    assert!(ISO_ENTRY_LEN == 10);
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalApicInfo {
    pub processor_id: u8,
    pub apic_id: u8,
    pub flags: u32,
}

impl LocalApicInfo {
    /// Enabled now, or can be brought online by the OS.
    pub fn is_usable(&self) -> bool {
        self.flags & (LAPIC_FLAG_ENABLED | LAPIC_FLAG_ONLINE_CAPABLE) != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoapicInfo {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    BusDefault,
    ActiveHigh,
    ActiveLow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    BusDefault,
    Edge,
    Level,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptOverride {
    pub bus_source: u8,
    pub irq_source: u8,
    pub gsi: u32,
    pub flags: u16,
}

impl InterruptOverride {
    pub fn polarity(&self) -> Polarity {
        match self.flags & 0x3 {
            0b01 => Polarity::ActiveHigh,
            0b11 => Polarity::ActiveLow,
            _ => Polarity::BusDefault,
        }
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        match (self.flags >> 2) & 0x3 {
            0b01 => TriggerMode::Edge,
            0b11 => TriggerMode::Level,
            _ => TriggerMode::BusDefault,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MadtEntry {
    LocalApic(LocalApicInfo),
    Ioapic(IoapicInfo),
    InterruptOverride(InterruptOverride),
    Unknown { entry_type: u8 },
}

impl MadtEntry {
    pub fn entry_type(&self) -> u8 {
        match self {
            MadtEntry::LocalApic(_) => MADT_ENTRY_LOCAL_APIC,
            MadtEntry::Ioapic(_) => MADT_ENTRY_IOAPIC,
            MadtEntry::InterruptOverride(_) => MADT_ENTRY_INTERRUPT_OVERRIDE,
            MadtEntry::Unknown { entry_type } => *entry_type,
        }
    }
}

/// Location of one variable-length entry inside the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawEntry {
    pub entry_type: u8,
    pub length: usize,
    pub offset: usize,
}

/// Parsed handle to the MADT, supporting iteration over its entries.
#[derive(Clone, Copy)]
pub struct Madt<'a> {
    bytes: &'a [u8],
}

impl<'a> Madt<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < MADT_ENTRIES_OFFSET || bytes[..4] != MADT_SIGNATURE[..] {
            return None;
        }
        let header = crate::tables::read_header(bytes)?;
        let length = header.length as usize;
        if length < MADT_ENTRIES_OFFSET || length > bytes.len() {
            klog_info!("ACPI: MADT too short");
            return None;
        }
        Some(Self {
            bytes: &bytes[..length],
        })
    }

    pub fn from_tables(tables: &AcpiTables<'_>) -> Option<Madt<'static>> {
        let Some(bytes) = tables.find_table(MADT_SIGNATURE) else {
            klog_info!("ACPI: MADT not found");
            return None;
        };
        Madt::from_bytes(bytes)
    }

    fn raw(&self) -> RawMadt {
        // SAFETY: `from_bytes` guarantees at least MADT_ENTRIES_OFFSET bytes.
        unsafe { read_unaligned(self.bytes.as_ptr() as *const RawMadt) }
    }

    pub fn lapic_address(&self) -> u32 {
        self.raw().lapic_address
    }

    pub fn flags(&self) -> u32 {
        self.raw().flags
    }

    pub fn has_legacy_pics(&self) -> bool {
        self.flags() & MADT_FLAG_PCAT_COMPAT != 0
    }

    /// Entry header at `offset`, or `None` past the end or on a malformed
    /// length.
    pub fn raw_entry_at(&self, offset: usize) -> Option<RawEntry> {
        let header_end = offset.checked_add(mem::size_of::<RawEntryHeader>())?;
        if offset < MADT_ENTRIES_OFFSET || header_end > self.bytes.len() {
            return None;
        }
        let entry_type = self.bytes[offset];
        let length = self.bytes[offset + 1] as usize;
        if length < mem::size_of::<RawEntryHeader>() || offset + length > self.bytes.len() {
            return None;
        }
        Some(RawEntry {
            entry_type,
            length,
            offset,
        })
    }

    pub fn parse_entry(&self, raw: RawEntry) -> MadtEntry {
        let ptr = self.bytes[raw.offset..].as_ptr();
        // SAFETY (all arms): each raw struct read is guarded by the entry's
        // own length, which `raw_entry_at` bounded by the table length.
        match raw.entry_type {
            MADT_ENTRY_LOCAL_APIC if raw.length >= LOCAL_APIC_ENTRY_LEN => {
                let e = unsafe { read_unaligned(ptr as *const RawLocalApicEntry) };
                MadtEntry::LocalApic(LocalApicInfo {
                    processor_id: e.processor_id,
                    apic_id: e.apic_id,
                    flags: e.flags,
                })
            }
            MADT_ENTRY_IOAPIC if raw.length >= IOAPIC_ENTRY_LEN => {
                let e = unsafe { read_unaligned(ptr as *const RawIoapicEntry) };
                MadtEntry::Ioapic(IoapicInfo {
                    id: e.ioapic_id,
                    address: e.ioapic_address,
                    gsi_base: e.gsi_base,
                })
            }
            MADT_ENTRY_INTERRUPT_OVERRIDE if raw.length >= ISO_ENTRY_LEN => {
                let e = unsafe { read_unaligned(ptr as *const RawIsoEntry) };
                MadtEntry::InterruptOverride(InterruptOverride {
                    bus_source: e.bus_source,
                    irq_source: e.irq_source,
                    gsi: e.gsi,
                    flags: e.flags,
                })
            }
            t => MadtEntry::Unknown { entry_type: t },
        }
    }

    pub fn entries(&self) -> MadtEntries<'a> {
        MadtEntries {
            madt: *self,
            offset: MADT_ENTRIES_OFFSET,
        }
    }
}

pub struct MadtEntries<'a> {
    madt: Madt<'a>,
    offset: usize,
}

impl Iterator for MadtEntries<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<MadtEntry> {
        let raw = self.madt.raw_entry_at(self.offset)?;
        self.offset = raw.offset + raw.length;
        Some(self.madt.parse_entry(raw))
    }
}


#[cfg(test)]
mod tests {
    use super::test_tables::*;
    use super::*;

    #[test]
    fn iterates_typed_entries_in_table_order() {
        let bytes = madt(
            MADT_FLAG_PCAT_COMPAT,
            &[
                lapic(0, 0, 1),
                lapic(1, 2, 0),
                ioapic(4, 0xFEC0_0000, 0),
                iso(0, 2, 0),
                iso(9, 9, 0b1111),
            ],
        );
        let madt = Madt::from_bytes(&bytes).unwrap();
        assert!(madt.has_legacy_pics());
        assert_eq!(madt.lapic_address(), 0xFEE0_0000);

        let entries: std::vec::Vec<MadtEntry> = madt.entries().collect();
        assert_eq!(entries.len(), 5);
        match entries[1] {
            MadtEntry::LocalApic(info) => {
                assert_eq!(info.apic_id, 2);
                assert!(!info.is_usable());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            entries[2],
            MadtEntry::Ioapic(IoapicInfo {
                id: 4,
                address: 0xFEC0_0000,
                gsi_base: 0
            })
        );
        match entries[4] {
            MadtEntry::InterruptOverride(ov) => {
                assert_eq!(ov.polarity(), Polarity::ActiveLow);
                assert_eq!(ov.trigger_mode(), TriggerMode::Level);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn zero_length_entry_stops_iteration() {
        let mut broken = lapic(0, 0, 1);
        broken[1] = 0;
        let bytes = madt(0, &[broken, ioapic(0, 0xFEC0_0000, 0)]);
        let madt = Madt::from_bytes(&bytes).unwrap();
        assert_eq!(madt.entries().count(), 0);
    }

    #[test]
    fn truncated_entry_is_unknown_not_misread() {
        let mut short = ioapic(0, 0xFEC0_0000, 0);
        short[1] = 6;
        short.truncate(6);
        let bytes = madt(0, &[short]);
        let madt = Madt::from_bytes(&bytes).unwrap();
        let entries: std::vec::Vec<MadtEntry> = madt.entries().collect();
        assert_eq!(entries, [MadtEntry::Unknown { entry_type: 1 }]);
    }
}
