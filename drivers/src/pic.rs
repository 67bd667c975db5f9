//! Dual 8259A PIC: remapping, masking, EOI and in-service lookup.
//!
//! Used as the interrupt controller when no Local APIC is present, and
//! otherwise only programmed far enough to be masked out of the way.

use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use kestrel_core::InterruptController;
use kestrel_lib::{HwPorts, PortBus, klog_debug, klog_trace};

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

pub const PIC_LINES: usize = 16;
pub const PIC_CASCADE_LINE: u8 = 2;

const PIC_EOI: u8 = 0x20;

const ICW1_ICW4: u8 = 0x01;
const ICW1_INIT: u8 = 0x10;
const ICW4_8086: u8 = 0x01;

const OCW3_READ_IRR: u8 = 0x0A;
const OCW3_READ_ISR: u8 = 0x0B;

/// Lowest-priority line on each chip; where spurious deliveries land.
const SPURIOUS_LINE: u8 = 7;

pub const DEFAULT_MASTER_OFFSET: u8 = 0x20;
pub const DEFAULT_SLAVE_OFFSET: u8 = 0x28;

pub struct Pic8259<P: PortBus> {
    ports: P,
    master_offset: AtomicU8,
    slave_offset: AtomicU8,
    /// Serializes mask read-modify-write and the ICW sequence.
    lock: Mutex<()>,
}

impl<P: PortBus> Pic8259<P> {
    pub const fn new(ports: P) -> Self {
        Self {
            ports,
            master_offset: AtomicU8::new(DEFAULT_MASTER_OFFSET),
            slave_offset: AtomicU8::new(DEFAULT_SLAVE_OFFSET),
            lock: Mutex::new(()),
        }
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    pub fn offsets(&self) -> (u8, u8) {
        (
            self.master_offset.load(Ordering::Relaxed),
            self.slave_offset.load(Ordering::Relaxed),
        )
    }

    /// Offsets used by the next [`Self::enable`] or [`Self::disable`].
    pub fn set_offsets(&self, master: u8, slave: u8) {
        self.master_offset.store(master, Ordering::Relaxed);
        self.slave_offset.store(slave, Ordering::Relaxed);
    }

    fn command(&self, port: u16, value: u8) {
        self.ports.write8(port, value);
        self.ports.io_wait();
    }

    /// Run the ICW1-4 sequence with new vector bases, keeping both masks.
    pub fn remap(&self, master_offset: u8, slave_offset: u8) {
        let _guard = self.lock.lock();
        self.remap_locked(master_offset, slave_offset);
    }

    fn remap_locked(&self, master_offset: u8, slave_offset: u8) {
        let master_mask = self.ports.read8(PIC1_DATA);
        let slave_mask = self.ports.read8(PIC2_DATA);

        self.command(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        self.command(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        self.command(PIC1_DATA, master_offset);
        self.command(PIC2_DATA, slave_offset);
        // Master: slave on IR2. Slave: cascade identity 2.
        self.command(PIC1_DATA, 1 << PIC_CASCADE_LINE);
        self.command(PIC2_DATA, PIC_CASCADE_LINE);
        self.command(PIC1_DATA, ICW4_8086);
        self.command(PIC2_DATA, ICW4_8086);

        self.ports.write8(PIC1_DATA, master_mask);
        self.ports.write8(PIC2_DATA, slave_mask);

        self.master_offset.store(master_offset, Ordering::Relaxed);
        self.slave_offset.store(slave_offset, Ordering::Relaxed);
        klog_debug!(
            "PIC: Remapped to 0x{:x}/0x{:x}",
            master_offset,
            slave_offset
        );
    }

    /// Remap to the configured offsets and unmask every line.
    pub fn enable(&self) {
        let (master, slave) = self.offsets();
        let _guard = self.lock.lock();
        self.remap_locked(master, slave);
        self.ports.write8(PIC1_DATA, 0x00);
        self.ports.write8(PIC2_DATA, 0x00);
    }

    /// Remap to the configured offsets and mask every line, so a stray
    /// legacy interrupt can never land on an exception vector.
    pub fn disable(&self) {
        let (master, slave) = self.offsets();
        let _guard = self.lock.lock();
        self.remap_locked(master, slave);
        self.ports.write8(PIC1_DATA, 0xFF);
        self.ports.write8(PIC2_DATA, 0xFF);
        klog_debug!("PIC: All lines masked");
    }

    /// End of interrupt: slave first for lines 8-15, master always.
    pub fn eoi(&self, irq: u8) {
        if irq >= 8 {
            self.ports.write8(PIC2_COMMAND, PIC_EOI);
        }
        self.ports.write8(PIC1_COMMAND, PIC_EOI);
    }

    fn read_pair(&self, ocw3: u8) -> u16 {
        self.ports.write8(PIC1_COMMAND, ocw3);
        self.ports.write8(PIC2_COMMAND, ocw3);
        let master = self.ports.read8(PIC1_COMMAND) as u16;
        let slave = self.ports.read8(PIC2_COMMAND) as u16;
        (slave << 8) | master
    }

    /// Request register, slave in the high byte.
    pub fn read_irr(&self) -> u16 {
        self.read_pair(OCW3_READ_IRR)
    }

    /// In-service register, slave in the high byte.
    pub fn read_isr(&self) -> u16 {
        self.read_pair(OCW3_READ_ISR)
    }

    /// Line currently in service, ignoring the cascade bit.
    pub fn get_irq(&self) -> Option<u8> {
        let isr = self.read_isr() & !(1 << PIC_CASCADE_LINE);
        (isr != 0).then(|| isr.trailing_zeros() as u8)
    }

    pub fn masks(&self) -> u16 {
        ((self.ports.read8(PIC2_DATA) as u16) << 8) | self.ports.read8(PIC1_DATA) as u16
    }

    fn update_mask(&self, irq: u8, masked: bool) {
        if irq as usize >= PIC_LINES {
            return;
        }
        let (port, bit) = if irq < 8 {
            (PIC1_DATA, irq)
        } else {
            (PIC2_DATA, irq - 8)
        };
        let _guard = self.lock.lock();
        let value = self.ports.read8(port);
        let value = if masked {
            value | (1 << bit)
        } else {
            value & !(1 << bit)
        };
        self.ports.write8(port, value);
        if !masked && irq >= 8 {
            let master = self.ports.read8(PIC1_DATA);
            self.ports.write8(PIC1_DATA, master & !(1 << PIC_CASCADE_LINE));
        }
    }

    pub fn mask_line(&self, irq: u8) {
        self.update_mask(irq, true);
    }

    /// Unmasking a slave line also opens the cascade on the master.
    pub fn unmask_line(&self, irq: u8) {
        self.update_mask(irq, false);
    }

    /// Line behind `vector` under the current remapping.
    fn line_for_vector(&self, vector: u8) -> Option<u8> {
        let (master, slave) = self.offsets();
        match vector {
            v if (master..master.saturating_add(8)).contains(&v) => Some(v - master),
            v if (slave..slave.saturating_add(8)).contains(&v) => Some(v - slave + 8),
            _ => None,
        }
    }
}

impl<P: PortBus + Sync + Send> InterruptController for Pic8259<P> {
    fn name(&self) -> &'static str {
        "8259 PIC"
    }

    fn line_count(&self) -> usize {
        PIC_LINES
    }

    fn current_irq(&self, vector: u8) -> Option<u8> {
        let line = self.line_for_vector(vector)?;
        match self.get_irq() {
            Some(irq) => Some(irq),
            None => {
                if line & 7 == SPURIOUS_LINE {
                    klog_trace!("PIC: Spurious IRQ {}", line);
                }
                None
            }
        }
    }

    fn eoi(&self, vector: u8, irq: Option<u8>) {
        match irq {
            Some(irq) => Pic8259::eoi(self, irq),
            None => match self.line_for_vector(vector) {
                // The master did see the cascade request for a slave
                // spurious delivery.
                Some(line) if line >= 8 => self.ports.write8(PIC1_COMMAND, PIC_EOI),
                _ => {}
            },
        }
    }

    fn mask_line(&self, irq: u8) {
        Pic8259::mask_line(self, irq);
    }

    fn unmask_line(&self, irq: u8) {
        Pic8259::unmask_line(self, irq);
    }
}

static PIC: Pic8259<HwPorts> = Pic8259::new(HwPorts);

#[inline]
pub fn pic() -> &'static Pic8259<HwPorts> {
    &PIC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePorts, PortOp};
    use kestrel_lib::io::IO_DELAY_PORT;

    fn fake_pic() -> Pic8259<FakePorts> {
        Pic8259::new(FakePorts::with_sticky(&[PIC1_COMMAND, PIC2_COMMAND]))
    }

    #[test]
    fn eoi_goes_to_slave_before_master() {
        let pic = fake_pic();
        pic.eoi(9);
        assert_eq!(
            pic.ports().writes(),
            [(PIC2_COMMAND, PIC_EOI), (PIC1_COMMAND, PIC_EOI)]
        );

        pic.ports().clear();
        pic.eoi(3);
        assert_eq!(pic.ports().writes(), [(PIC1_COMMAND, PIC_EOI)]);
    }

    #[test]
    fn remap_runs_icw_sequence_and_restores_masks() {
        let pic = fake_pic();
        pic.ports().set(PIC1_DATA, 0xAB);
        pic.ports().set(PIC2_DATA, 0xCD);

        pic.remap(0x30, 0x38);

        assert_eq!(
            pic.ports().writes(),
            [
                (PIC1_COMMAND, 0x11),
                (PIC2_COMMAND, 0x11),
                (PIC1_DATA, 0x30),
                (PIC2_DATA, 0x38),
                (PIC1_DATA, 0x04),
                (PIC2_DATA, 0x02),
                (PIC1_DATA, 0x01),
                (PIC2_DATA, 0x01),
                (PIC1_DATA, 0xAB),
                (PIC2_DATA, 0xCD),
            ]
        );
        let delays = pic
            .ports()
            .ops()
            .iter()
            .filter(|op| matches!(op, PortOp::Write(IO_DELAY_PORT, _)))
            .count();
        assert_eq!(delays, 8);
        assert_eq!(pic.offsets(), (0x30, 0x38));
    }

    #[test]
    fn disable_masks_everything_and_enable_clears() {
        let pic = fake_pic();
        pic.disable();
        assert_eq!(pic.masks(), 0xFFFF);
        pic.enable();
        assert_eq!(pic.masks(), 0x0000);
    }

    #[test]
    fn get_irq_ignores_cascade_bit() {
        let pic = fake_pic();
        pic.ports().set(PIC1_COMMAND, 1 << PIC_CASCADE_LINE);
        pic.ports().set(PIC2_COMMAND, 0x02);
        assert_eq!(pic.get_irq(), Some(9));

        pic.ports().set(PIC2_COMMAND, 0x00);
        assert_eq!(pic.get_irq(), None);

        pic.ports().set(PIC1_COMMAND, 0x05);
        assert_eq!(pic.get_irq(), Some(0));
    }

    #[test]
    fn unmasking_slave_line_opens_cascade() {
        let pic = fake_pic();
        pic.ports().set(PIC1_DATA, 0xFF);
        pic.ports().set(PIC2_DATA, 0xFF);
        pic.unmask_line(10);
        assert_eq!(pic.masks(), 0xFBFB);
        pic.mask_line(10);
        assert_eq!(pic.masks(), 0xFFFB);
        pic.mask_line(16);
        assert_eq!(pic.masks(), 0xFFFB);
    }

    #[test]
    fn spurious_slave_delivery_still_acks_master() {
        let pic = fake_pic();
        let vector = DEFAULT_SLAVE_OFFSET + 7;
        assert_eq!(InterruptController::current_irq(&pic, vector), None);
        pic.ports().clear();
        InterruptController::eoi(&pic, vector, None);
        assert_eq!(pic.ports().writes(), [(PIC1_COMMAND, PIC_EOI)]);

        pic.ports().clear();
        InterruptController::eoi(&pic, DEFAULT_MASTER_OFFSET + 7, None);
        assert!(pic.ports().writes().is_empty());
    }

    #[test]
    fn vectors_outside_the_pic_ranges_name_no_line() {
        let pic = fake_pic();
        pic.ports().set(PIC1_COMMAND, 0x01);
        assert_eq!(InterruptController::current_irq(&pic, 0x40), None);
        assert_eq!(InterruptController::current_irq(&pic, 0x20), Some(0));
    }
}
