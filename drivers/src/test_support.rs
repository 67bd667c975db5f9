//! Recording hardware doubles shared by the driver tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::vec::Vec;

use kestrel_acpi::{InterruptMode, MadtEntry, PlatformTables, SearchCursor};
use kestrel_lib::PortBus;
use kestrel_lib::io::IO_DELAY_PORT;
use kestrel_mm::RegisterBus;

use crate::ioapic::regs::{
    IOAPIC_IOREGSEL, IOAPIC_IOWIN, IOAPIC_REG_VER, max_redirection_from_version, redir_low_index,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortOp {
    Read(u16),
    Write(u16, u8),
}

/// Port space where a read returns the last value written to that port,
/// unless the port is listed in `sticky` (device-owned registers such as
/// the PIC command ports, which tests preload).
pub struct FakePorts {
    values: Mutex<[u8; 0x100]>,
    sticky: Vec<u16>,
    ops: Mutex<Vec<PortOp>>,
}

impl FakePorts {
    pub fn new() -> Self {
        Self::with_sticky(&[])
    }

    pub fn with_sticky(ports: &[u16]) -> Self {
        Self {
            values: Mutex::new([0; 0x100]),
            sticky: ports.to_vec(),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, port: u16, value: u8) {
        self.values.lock().unwrap()[port as usize] = value;
    }

    pub fn get(&self, port: u16) -> u8 {
        self.values.lock().unwrap()[port as usize]
    }

    pub fn ops(&self) -> Vec<PortOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Writes in order, without the I/O-delay port.
    pub fn writes(&self) -> Vec<(u16, u8)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                PortOp::Write(port, value) if port != IO_DELAY_PORT => Some((port, value)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.ops.lock().unwrap().clear();
    }
}

impl PortBus for FakePorts {
    fn read8(&self, port: u16) -> u8 {
        self.ops.lock().unwrap().push(PortOp::Read(port));
        self.get(port)
    }

    fn write8(&self, port: u16, value: u8) {
        self.ops.lock().unwrap().push(PortOp::Write(port, value));
        if !self.sticky.contains(&port) && (port as usize) < 0x100 {
            self.set(port, value);
        }
    }
}

/// 32-bit register page: reads return the last write (or a preset), every
/// write is logged in order.
#[derive(Default)]
pub struct FakeRegisters {
    values: Mutex<BTreeMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
}

impl FakeRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, offset: usize, value: u32) {
        self.values.lock().unwrap().insert(offset, value);
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.values.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes()
            .into_iter()
            .filter_map(|(o, v)| (o == offset).then_some(v))
            .collect()
    }

    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl RegisterBus for FakeRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.writes.lock().unwrap().push((offset, value));
        self.set(offset, value);
    }
}

/// Platform tables served from a list of already parsed MADT entries.
pub struct FakePlatform {
    entries: Vec<MadtEntry>,
    supported: bool,
    legacy_pics: bool,
    mode: Mutex<Option<InterruptMode>>,
}

impl FakePlatform {
    pub fn new(entries: &[MadtEntry]) -> Self {
        Self {
            entries: entries.to_vec(),
            supported: true,
            legacy_pics: true,
            mode: Mutex::new(None),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new(&[])
        }
    }

    pub fn without_legacy_pics(mut self) -> Self {
        self.legacy_pics = false;
        self
    }

    pub fn mode(&self) -> Option<InterruptMode> {
        *self.mode.lock().unwrap()
    }
}

impl PlatformTables for FakePlatform {
    fn supported(&self) -> bool {
        self.supported
    }

    fn search_entries(
        &self,
        entry_type: u8,
        _min_length: usize,
        cursor: &mut SearchCursor,
    ) -> Option<MadtEntry> {
        let base = SearchCursor::START.offset();
        let start = cursor.offset().checked_sub(base)?;
        let (index, entry) = self
            .entries
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, e)| e.entry_type() == entry_type)?;
        *cursor = SearchCursor::at(base + index + 1);
        Some(*entry)
    }

    fn change_interrupt_mode(&self, mode: InterruptMode) -> bool {
        *self.mode.lock().unwrap() = Some(mode);
        self.supported || mode == InterruptMode::Pic
    }

    fn has_legacy_pics(&self) -> bool {
        self.legacy_pics
    }
}

/// Select/data window over an indirect register file.
pub struct FakeIoWindow {
    select: Mutex<u32>,
    regs: Mutex<[u32; 0x40]>,
    /// (register, value) for every data write, in order.
    writes: Mutex<Vec<(u8, u32)>>,
}

impl FakeIoWindow {
    pub fn new(version: u32) -> Self {
        let mut regs = [0; 0x40];
        regs[IOAPIC_REG_VER as usize] = version;
        // Firmware leaves everything unmasked.
        for pin in 0..max_redirection_from_version(version) {
            regs[redir_low_index(pin) as usize] = 0x30 + pin;
        }
        Self {
            select: Mutex::new(0),
            regs: Mutex::new(regs),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn reg(&self, index: u8) -> u32 {
        self.regs.lock().unwrap()[index as usize]
    }

    pub fn writes(&self) -> Vec<(u8, u32)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl RegisterBus for FakeIoWindow {
    fn read32(&self, offset: usize) -> u32 {
        assert_eq!(offset, IOAPIC_IOWIN);
        let select = *self.select.lock().unwrap();
        self.regs.lock().unwrap()[select as usize]
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset == IOAPIC_IOREGSEL {
            *self.select.lock().unwrap() = value;
            return;
        }
        assert_eq!(offset, IOAPIC_IOWIN);
        let select = *self.select.lock().unwrap();
        self.regs.lock().unwrap()[select as usize] = value;
        self.writes.lock().unwrap().push((select as u8, value));
    }
}
