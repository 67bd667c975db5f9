//! Segment selectors for gates, and the flat descriptors of the AP
//! trampoline's temporary GDT.

/// Selector value: index << 3 | table indicator | RPL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SegmentSelector(pub u16);

impl SegmentSelector {
    pub const KERNEL_CODE: Self = Self::gdt(1);
    pub const KERNEL_DATA: Self = Self::gdt(2);

    /// Temporary table used while an AP climbs to long mode: 32-bit code,
    /// flat data, then 64-bit code.
    pub const TRAMPOLINE_CODE32: Self = Self::gdt(1);
    pub const TRAMPOLINE_DATA: Self = Self::gdt(2);
    pub const TRAMPOLINE_CODE64: Self = Self::gdt(3);

    pub const fn gdt(index: u16) -> Self {
        Self(index << 3)
    }

    pub const fn with_rpl(self, rpl: u8) -> Self {
        Self((self.0 & !0x3) | (rpl as u16 & 0x3))
    }

    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    #[inline]
    pub const fn rpl(self) -> u8 {
        (self.0 & 0x3) as u8
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }
}

const ACCESS_CODE: u8 = 0x9A;
const ACCESS_DATA: u8 = 0x92;
/// 4 KiB granularity, 32-bit default size.
const FLAGS_PROTECTED: u8 = 0xC;
/// 4 KiB granularity, long-mode code.
const FLAGS_LONG: u8 = 0xA;

/// Base 0, limit 0xFFFFF pages.
pub const fn flat_descriptor(access: u8, flags: u8) -> u64 {
    0xFFFF | ((access as u64) << 40) | (0xF << 48) | (((flags & 0xF) as u64) << 52)
}

pub const FLAT_CODE32: u64 = flat_descriptor(ACCESS_CODE, FLAGS_PROTECTED);
pub const FLAT_DATA: u64 = flat_descriptor(ACCESS_DATA, FLAGS_PROTECTED);
pub const FLAT_CODE64: u64 = flat_descriptor(ACCESS_CODE, FLAGS_LONG);

const _: () = {
    assert!(SegmentSelector::KERNEL_CODE.0 == 0x08);
    assert!(SegmentSelector::KERNEL_DATA.0 == 0x10);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_fields() {
        let sel = SegmentSelector::gdt(4).with_rpl(3);
        assert_eq!(sel.bits(), 0x23);
        assert_eq!(sel.index(), 4);
        assert_eq!(sel.rpl(), 3);
        assert_eq!(SegmentSelector::TRAMPOLINE_CODE64.bits(), 0x18);
    }

    #[test]
    fn flat_descriptors_match_the_manual_encodings() {
        assert_eq!(FLAT_CODE32, 0x00CF_9A00_0000_FFFF);
        assert_eq!(FLAT_DATA, 0x00CF_9200_0000_FFFF);
        assert_eq!(FLAT_CODE64, 0x00AF_9A00_0000_FFFF);
    }
}
