//! Platform-table collaborator consumed by the controller drivers.
//!
//! Drivers never walk ACPI structures themselves; they ask for entries of one
//! MADT type with [`PlatformTables::search_entries`], resuming from a cursor,
//! the same way a firmware "find next entry" service works.

use core::sync::atomic::{AtomicU8, Ordering};

use kestrel_lib::{klog_debug, klog_info};

use crate::madt::{MADT_ENTRIES_OFFSET, Madt, MadtEntry};
use crate::tables::AcpiTables;

/// Which interrupt model the firmware was told the OS uses.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptMode {
    Pic = 0,
    Apic = 1,
}

/// Resume point for [`PlatformTables::search_entries`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchCursor {
    offset: usize,
}

impl SearchCursor {
    pub const START: Self = Self {
        offset: MADT_ENTRIES_OFFSET,
    };

    /// Cursor at a byte offset into the table, for other table providers.
    pub const fn at(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl Default for SearchCursor {
    fn default() -> Self {
        Self::START
    }
}

pub trait PlatformTables: Sync {
    /// Tables describing the APIC topology are present.
    fn supported(&self) -> bool;

    /// Next entry of `entry_type` at least `min_length` bytes long, starting
    /// at `cursor`. The cursor is advanced past the returned entry.
    fn search_entries(
        &self,
        entry_type: u8,
        min_length: usize,
        cursor: &mut SearchCursor,
    ) -> Option<MadtEntry>;

    /// Tell the firmware which interrupt model is in use.
    fn change_interrupt_mode(&self, mode: InterruptMode) -> bool;

    /// Dual 8259s are wired and must be masked before APIC mode.
    fn has_legacy_pics(&self) -> bool {
        true
    }
}

/// [`PlatformTables`] backed by a parsed MADT.
///
/// Evaluating `\_PIC` needs an AML interpreter; the requested mode is
/// recorded and accepted whenever the tables support it.
pub struct MadtPlatform<'a> {
    madt: Option<Madt<'a>>,
    mode: AtomicU8,
}

impl<'a> MadtPlatform<'a> {
    pub const fn new(madt: Option<Madt<'a>>) -> Self {
        Self {
            madt,
            mode: AtomicU8::new(InterruptMode::Pic as u8),
        }
    }

    pub const fn absent() -> Self {
        Self::new(None)
    }

    pub fn from_tables(tables: &AcpiTables<'_>) -> MadtPlatform<'static> {
        MadtPlatform::new(Madt::from_tables(tables))
    }

    pub fn current_mode(&self) -> InterruptMode {
        if self.mode.load(Ordering::Acquire) == InterruptMode::Apic as u8 {
            InterruptMode::Apic
        } else {
            InterruptMode::Pic
        }
    }
}

impl PlatformTables for MadtPlatform<'_> {
    fn supported(&self) -> bool {
        self.madt.is_some()
    }

    fn search_entries(
        &self,
        entry_type: u8,
        min_length: usize,
        cursor: &mut SearchCursor,
    ) -> Option<MadtEntry> {
        let madt = self.madt.as_ref()?;
        while let Some(raw) = madt.raw_entry_at(cursor.offset) {
            cursor.offset = raw.offset + raw.length;
            if raw.entry_type == entry_type && raw.length >= min_length {
                return Some(madt.parse_entry(raw));
            }
        }
        None
    }

    fn change_interrupt_mode(&self, mode: InterruptMode) -> bool {
        if mode == InterruptMode::Apic && self.madt.is_none() {
            klog_info!("ACPI: APIC mode requested without a MADT");
            return false;
        }
        self.mode.store(mode as u8, Ordering::Release);
        klog_debug!("ACPI: interrupt model set to {:?}", mode);
        true
    }

    fn has_legacy_pics(&self) -> bool {
        self.madt.as_ref().is_none_or(|m| m.has_legacy_pics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::madt::test_tables::*;
    use crate::madt::{IOAPIC_ENTRY_LEN, MADT_ENTRY_IOAPIC, MADT_ENTRY_LOCAL_APIC};

    #[test]
    fn cursor_resumes_after_each_match() {
        let bytes = madt(
            0,
            &[
                lapic(0, 0, 1),
                ioapic(1, 0xFEC0_0000, 0),
                lapic(1, 1, 1),
                lapic(2, 6, 1),
            ],
        );
        let platform = MadtPlatform::new(Madt::from_bytes(&bytes));
        let mut cursor = SearchCursor::START;
        let mut ids = std::vec::Vec::new();
        while let Some(MadtEntry::LocalApic(info)) =
            platform.search_entries(MADT_ENTRY_LOCAL_APIC, 8, &mut cursor)
        {
            ids.push(info.apic_id);
        }
        assert_eq!(ids, [0, 1, 6]);
        assert!(platform.search_entries(MADT_ENTRY_LOCAL_APIC, 8, &mut cursor).is_none());
    }

    #[test]
    fn min_length_filters_short_entries() {
        let bytes = madt(0, &[ioapic(1, 0xFEC0_0000, 0)]);
        let platform = MadtPlatform::new(Madt::from_bytes(&bytes));
        let mut cursor = SearchCursor::START;
        assert!(platform
            .search_entries(MADT_ENTRY_IOAPIC, IOAPIC_ENTRY_LEN + 4, &mut cursor)
            .is_none());
    }

    #[test]
    fn apic_mode_needs_tables() {
        let absent = MadtPlatform::absent();
        assert!(!absent.supported());
        assert!(!absent.change_interrupt_mode(InterruptMode::Apic));
        assert_eq!(absent.current_mode(), InterruptMode::Pic);

        let bytes = madt(0, &[]);
        let present = MadtPlatform::new(Madt::from_bytes(&bytes));
        assert!(present.change_interrupt_mode(InterruptMode::Apic));
        assert_eq!(present.current_mode(), InterruptMode::Apic);
        assert!(!present.has_legacy_pics());
    }
}
