//! I/O APIC hardware definitions.
//!
//! Register offsets and the redirection entry layout. MADT parsing lives in
//! `kestrel_acpi::madt`.

use bitflags::bitflags;

// =============================================================================
// Window and Register Offsets
// =============================================================================

pub(crate) const IOAPIC_REGION_SIZE: usize = 0x20;
pub(crate) const IOAPIC_IOREGSEL: usize = 0x00;
pub(crate) const IOAPIC_IOWIN: usize = 0x10;

pub(crate) const IOAPIC_REG_VER: u8 = 0x01;
pub(crate) const IOAPIC_REG_REDIR_BASE: u8 = 0x10;

/// ISA IRQs an interrupt source override can retarget.
pub const ISA_IRQ_COUNT: usize = 16;

/// Pins addressable through the 8-bit register select: the last entry's
/// high half sits at 0x10 + 2 * 119 + 1 = 0xFF.
pub const IOAPIC_MAX_PINS: u32 = 120;

#[inline]
pub(crate) const fn redir_low_index(pin: u32) -> u8 {
    let index = IOAPIC_REG_REDIR_BASE as u32 + pin * 2;
    if index > u8::MAX as u32 - 1 {
        u8::MAX - 1
    } else {
        index as u8
    }
}

#[inline]
pub(crate) const fn redir_high_index(pin: u32) -> u8 {
    redir_low_index(pin) + 1
}

/// Entries supported by a controller, from its version register, capped
/// at [`IOAPIC_MAX_PINS`].
#[inline]
pub const fn max_redirection_from_version(version: u32) -> u32 {
    let entries = ((version >> 16) & 0xFF) + 1;
    if entries > IOAPIC_MAX_PINS {
        IOAPIC_MAX_PINS
    } else {
        entries
    }
}

// =============================================================================
// Redirection Entry
// =============================================================================

bitflags! {
    /// Single-bit fields of the low dword.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RedirectionFlags: u32 {
        const DEST_LOGICAL = 1 << 11;
        const DELIVERY_PENDING = 1 << 12;
        const POLARITY_LOW = 1 << 13;
        const REMOTE_IRR = 1 << 14;
        const TRIGGER_LEVEL = 1 << 15;
        const MASKED = 1 << 16;
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed = 0,
    LowestPriority = 1,
    Smi = 2,
    Nmi = 4,
    Init = 5,
    ExtInt = 7,
}

impl DeliveryMode {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            1 => Self::LowestPriority,
            2 => Self::Smi,
            4 => Self::Nmi,
            5 => Self::Init,
            7 => Self::ExtInt,
            _ => Self::Fixed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryPolarity {
    ActiveHigh,
    ActiveLow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryTrigger {
    Edge,
    Level,
}

const VECTOR_MASK: u64 = 0xFF;
const DELIVERY_SHIFT: u32 = 8;
const DESTINATION_SHIFT: u32 = 56;

/// One 64-bit redirection table entry.
///
/// The low dword carries vector, delivery mode, polarity, trigger and mask;
/// the high dword's top byte is the destination APIC id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectionEntry(u64);

impl RedirectionEntry {
    /// Masked, vector 0, fixed, physical, edge, active high.
    pub const MASKED: Self = Self(RedirectionFlags::MASKED.bits() as u64);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn from_halves(low: u32, high: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Unmasked fixed-delivery entry, physical destination `apic_id`.
    pub const fn fixed(vector: u8, apic_id: u8) -> Self {
        Self(vector as u64 | ((apic_id as u64) << DESTINATION_SHIFT))
    }

    fn flags(self) -> RedirectionFlags {
        RedirectionFlags::from_bits_truncate(self.low())
    }

    fn with_flag(self, flag: RedirectionFlags, set: bool) -> Self {
        if set {
            Self(self.0 | flag.bits() as u64)
        } else {
            Self(self.0 & !(flag.bits() as u64))
        }
    }

    pub fn vector(self) -> u8 {
        (self.0 & VECTOR_MASK) as u8
    }

    pub fn with_vector(self, vector: u8) -> Self {
        Self((self.0 & !VECTOR_MASK) | vector as u64)
    }

    pub fn delivery_mode(self) -> DeliveryMode {
        DeliveryMode::from_bits((self.0 >> DELIVERY_SHIFT) as u8)
    }

    pub fn with_delivery_mode(self, mode: DeliveryMode) -> Self {
        Self((self.0 & !(0x7 << DELIVERY_SHIFT)) | ((mode as u64) << DELIVERY_SHIFT))
    }

    pub fn is_logical(self) -> bool {
        self.flags().contains(RedirectionFlags::DEST_LOGICAL)
    }

    pub fn with_logical(self, logical: bool) -> Self {
        self.with_flag(RedirectionFlags::DEST_LOGICAL, logical)
    }

    pub fn polarity(self) -> EntryPolarity {
        if self.flags().contains(RedirectionFlags::POLARITY_LOW) {
            EntryPolarity::ActiveLow
        } else {
            EntryPolarity::ActiveHigh
        }
    }

    pub fn with_polarity(self, polarity: EntryPolarity) -> Self {
        self.with_flag(
            RedirectionFlags::POLARITY_LOW,
            polarity == EntryPolarity::ActiveLow,
        )
    }

    pub fn trigger(self) -> EntryTrigger {
        if self.flags().contains(RedirectionFlags::TRIGGER_LEVEL) {
            EntryTrigger::Level
        } else {
            EntryTrigger::Edge
        }
    }

    pub fn with_trigger(self, trigger: EntryTrigger) -> Self {
        self.with_flag(
            RedirectionFlags::TRIGGER_LEVEL,
            trigger == EntryTrigger::Level,
        )
    }

    pub fn is_masked(self) -> bool {
        self.flags().contains(RedirectionFlags::MASKED)
    }

    pub fn with_masked(self, masked: bool) -> Self {
        self.with_flag(RedirectionFlags::MASKED, masked)
    }

    /// Delivery still pending in the controller (read-only bit).
    pub fn is_pending(self) -> bool {
        self.flags().contains(RedirectionFlags::DELIVERY_PENDING)
    }

    pub fn remote_irr(self) -> bool {
        self.flags().contains(RedirectionFlags::REMOTE_IRR)
    }

    pub fn destination(self) -> u8 {
        (self.0 >> DESTINATION_SHIFT) as u8
    }

    pub fn with_destination(self, apic_id: u8) -> Self {
        Self((self.0 & !(0xFF << DESTINATION_SHIFT)) | ((apic_id as u64) << DESTINATION_SHIFT))
    }
}
