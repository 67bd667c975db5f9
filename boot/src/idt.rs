//! The kernel's Interrupt Descriptor Table.
//!
//! One static 256-entry table shared by every processor. Gates are written
//! only through the builder methods below; each processor points its IDTR
//! at the table with [`Idt::load`].

use spin::Mutex;
use x86_64::VirtAddr;
use x86_64::structures::DescriptorTablePointer;

use kestrel_lib::arch::gdt::SegmentSelector;
use kestrel_lib::arch::idt::{
    EXCEPTION_VECTORS, GateDescriptor, GateKind, IDT_ENTRIES, IDT_LIMIT, IdtEntry, PrivilegeLevel,
};
use kestrel_lib::{klog_debug, klog_warn};

const MAX_IST_INDEX: u8 = 7;

pub struct Idt {
    entries: Mutex<[IdtEntry; IDT_ENTRIES]>,
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new([IdtEntry::zero(); IDT_ENTRIES]),
        }
    }

    pub fn set_gate(
        &self,
        vector: u8,
        target: u64,
        selector: SegmentSelector,
        kind: GateKind,
        privilege: PrivilegeLevel,
        present: bool,
    ) {
        self.entries.lock()[vector as usize] =
            IdtEntry::new(target, selector, kind, privilege, present);
    }

    /// Kernel code selector, ring 0, IF cleared on entry.
    pub fn open_interrupt_gate(&self, vector: u8, target: u64) {
        self.set_gate(
            vector,
            target,
            SegmentSelector::KERNEL_CODE,
            GateKind::Interrupt,
            PrivilegeLevel::Ring0,
            true,
        );
    }

    /// Like [`Idt::open_interrupt_gate`] but IF is left alone.
    pub fn open_trap_gate(&self, vector: u8, target: u64) {
        self.set_gate(
            vector,
            target,
            SegmentSelector::KERNEL_CODE,
            GateKind::Trap,
            PrivilegeLevel::Ring0,
            true,
        );
    }

    /// Zero a gate. Exception vectors stay open once opened.
    pub fn close_gate(&self, vector: u8) {
        if (vector as usize) < EXCEPTION_VECTORS {
            klog_warn!("IDT: Refusing to close exception vector {}", vector);
            return;
        }
        self.entries.lock()[vector as usize] = IdtEntry::zero();
    }

    /// `None` for a closed (zeroed) gate.
    pub fn gate(&self, vector: u8) -> Option<GateDescriptor> {
        self.entries.lock()[vector as usize].decode()
    }

    pub fn set_ist(&self, vector: u8, index: u8) {
        if index > MAX_IST_INDEX {
            klog_warn!("IDT: Invalid IST index {} for vector {}", index, vector);
            return;
        }
        self.entries.lock()[vector as usize].set_ist_index(index);
    }

    pub fn pointer(&self) -> DescriptorTablePointer {
        let base = self.entries.lock().as_ptr() as u64;
        DescriptorTablePointer {
            limit: IDT_LIMIT,
            base: VirtAddr::new(base),
        }
    }

    /// Point the calling processor's IDTR at this table.
    pub fn load(&'static self) {
        let pointer = self.pointer();
        // SAFETY: the table is 'static and every entry is either zeroed or
        // a gate written by the builder above.
        unsafe { x86_64::instructions::tables::lidt(&pointer) };
        klog_debug!(
            "IDT: Loaded base=0x{:x} limit=0x{:x}",
            pointer.base.as_u64(),
            pointer.limit
        );
    }
}

static IDT: Idt = Idt::new();

#[inline]
pub fn idt() -> &'static Idt {
    &IDT
}
