//! Interrupt Descriptor Table (IDT) definitions.
//!
//! Constants for CPU exception vectors, the hardware IRQ base, and the
//! 16-byte long-mode gate encoding.

use super::gdt::SegmentSelector;

// =============================================================================
// Gate Types
// =============================================================================

/// Interrupt gate type attribute (DPL=0, present, interrupt gate).
/// Clears IF on entry.
pub const IDT_GATE_INTERRUPT: u8 = 0x8E;

/// Trap gate type attribute (DPL=0, present, trap gate).
/// Does not clear IF on entry.
pub const IDT_GATE_TRAP: u8 = 0x8F;

const GATE_PRESENT: u8 = 0x80;
const GATE_DPL_SHIFT: u8 = 5;
const GATE_TYPE_MASK: u8 = 0x0F;

// =============================================================================
// CPU Exception Vectors (0-31)
// =============================================================================

pub const EXCEPTION_DIVIDE_ERROR: u8 = 0;
pub const EXCEPTION_DEBUG: u8 = 1;
pub const EXCEPTION_NMI: u8 = 2;
pub const EXCEPTION_BREAKPOINT: u8 = 3;
pub const EXCEPTION_OVERFLOW: u8 = 4;
pub const EXCEPTION_BOUND_RANGE: u8 = 5;
pub const EXCEPTION_INVALID_OPCODE: u8 = 6;
pub const EXCEPTION_DEVICE_NOT_AVAIL: u8 = 7;
pub const EXCEPTION_DOUBLE_FAULT: u8 = 8;
pub const EXCEPTION_COPROCESSOR_OVERRUN: u8 = 9;
pub const EXCEPTION_INVALID_TSS: u8 = 10;
pub const EXCEPTION_SEGMENT_NOT_PRES: u8 = 11;
pub const EXCEPTION_STACK_FAULT: u8 = 12;
pub const EXCEPTION_GENERAL_PROTECTION: u8 = 13;
pub const EXCEPTION_PAGE_FAULT: u8 = 14;
/// Reserved - vector 15.
pub const EXCEPTION_RESERVED_15: u8 = 15;
pub const EXCEPTION_FPU_ERROR: u8 = 16;
pub const EXCEPTION_ALIGNMENT_CHECK: u8 = 17;
pub const EXCEPTION_MACHINE_CHECK: u8 = 18;
pub const EXCEPTION_SIMD_FP_EXCEPTION: u8 = 19;
pub const EXCEPTION_VIRTUALIZATION: u8 = 20;
pub const EXCEPTION_CONTROL_PROTECTION: u8 = 21;
// Vectors 22-31 are reserved

/// Number of vectors reserved for CPU exceptions.
pub const EXCEPTION_VECTORS: usize = 32;

// =============================================================================
// Hardware IRQ Vectors
// =============================================================================

/// Base vector for hardware IRQs (IRQ0 maps to this vector).
pub const IRQ_BASE_VECTOR: u8 = 32;

/// Local APIC spurious-interrupt vector. The low nibble must be all ones on
/// older parts, so the top vector is used.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Number of entries in the IDT (256 vectors).
pub const IDT_ENTRIES: usize = 256;

/// `lidt` limit for a full table.
pub const IDT_LIMIT: u16 = (IDT_ENTRIES * core::mem::size_of::<IdtEntry>() - 1) as u16;

// =============================================================================
// Gate attributes
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateKind {
    Interrupt = 0xE,
    Trap = 0xF,
}

impl GateKind {
    fn from_type_bits(bits: u8) -> Option<Self> {
        match bits & GATE_TYPE_MASK {
            0xE => Some(GateKind::Interrupt),
            0xF => Some(GateKind::Trap),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

impl PrivilegeLevel {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => PrivilegeLevel::Ring0,
            1 => PrivilegeLevel::Ring1,
            2 => PrivilegeLevel::Ring2,
            _ => PrivilegeLevel::Ring3,
        }
    }
}

/// Decoded view of one gate, as written by the table builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateDescriptor {
    pub target: u64,
    pub selector: SegmentSelector,
    pub kind: GateKind,
    pub privilege: PrivilegeLevel,
    pub present: bool,
    pub ist: u8,
}

// =============================================================================
// IDT Entry
// =============================================================================

/// x86-64 IDT (Interrupt Descriptor Table) entry.
///
/// Layout must match the hardware-defined format (Intel SDM Vol. 3A, 6.14.1).
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct IdtEntry {
    pub offset_low: u16,
    pub selector: u16,
    pub ist: u8,
    pub type_attr: u8,
    pub offset_mid: u16,
    pub offset_high: u32,
    pub zero: u32,
}

impl IdtEntry {
    pub const fn zero() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            zero: 0,
        }
    }

    pub const fn new(
        target: u64,
        selector: SegmentSelector,
        kind: GateKind,
        privilege: PrivilegeLevel,
        present: bool,
    ) -> Self {
        let present_bit = if present { GATE_PRESENT } else { 0 };
        Self {
            offset_low: (target & 0xFFFF) as u16,
            selector: selector.0,
            ist: 0,
            type_attr: kind as u8 | present_bit | ((privilege as u8) << GATE_DPL_SHIFT),
            offset_mid: ((target >> 16) & 0xFFFF) as u16,
            offset_high: (target >> 32) as u32,
            zero: 0,
        }
    }

    #[inline]
    pub fn target(&self) -> u64 {
        let low = self.offset_low as u64;
        let mid = self.offset_mid as u64;
        let high = self.offset_high as u64;
        low | (mid << 16) | (high << 32)
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.type_attr & GATE_PRESENT != 0
    }

    #[inline]
    pub fn ist_index(&self) -> u8 {
        self.ist & 0x7
    }

    #[inline]
    pub fn set_ist_index(&mut self, index: u8) {
        self.ist = index & 0x7;
    }

    /// Decode the entry; `None` for a zeroed or non-gate entry.
    pub fn decode(&self) -> Option<GateDescriptor> {
        let kind = GateKind::from_type_bits(self.type_attr)?;
        Some(GateDescriptor {
            target: self.target(),
            selector: SegmentSelector(self.selector),
            kind,
            privilege: PrivilegeLevel::from_bits(self.type_attr >> GATE_DPL_SHIFT),
            present: self.is_present(),
            ist: self.ist_index(),
        })
    }
}

const _: () = {
    assert!(core::mem::size_of::<IdtEntry>() == 16);
    assert!(IDT_LIMIT == 4095);
};
