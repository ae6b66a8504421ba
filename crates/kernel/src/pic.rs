//! The pair of cascaded 8259A programmable interrupt controllers.
//!
//! IRQs 0-7 are remapped to vectors 32-39 and IRQs 8-15 to 40-47 so they do not
//! collide with CPU exceptions.

use crate::{arch, interrupts::InterruptVector};

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

/// Unused port written between initialisation words to give the controller time.
const WAIT_PORT: u16 = 0x80;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const OCW3_READ_ISR: u8 = 0x0B;
const EOI: u8 = 0x20;

/// IRQ line the slave is cascaded on.
const CASCADE_IRQ: u8 = 2;

pub const MASTER_OFFSET: u8 = 32;
pub const SLAVE_OFFSET: u8 = 40;
pub const IRQ_COUNT: u8 = 16;

pub const TIMER_IRQ: u8 = 0;

/// Returns the IRQ line delivered on `vector`, if it is one of the remapped
/// PIC vectors.
pub fn irq_for(vector: InterruptVector) -> Option<u8> {
    let value = vector.value();
    (MASTER_OFFSET..MASTER_OFFSET + IRQ_COUNT)
        .contains(&value)
        .then(|| value - MASTER_OFFSET)
}

#[derive(Debug)]
pub struct Pic {
    masks: [u8; 2],
}

impl Pic {
    /// A controller pair with every line masked.
    pub const fn new() -> Self {
        Self { masks: [0xFF; 2] }
    }

    /// Runs the initialisation sequence and applies the current masks.
    pub fn init(&mut self) {
        // SAFETY: These ports belong to the 8259s and nothing else drives them.
        unsafe {
            write(MASTER_COMMAND, ICW1_INIT | ICW1_ICW4);
            write(SLAVE_COMMAND, ICW1_INIT | ICW1_ICW4);
            write(MASTER_DATA, MASTER_OFFSET);
            write(SLAVE_DATA, SLAVE_OFFSET);
            write(MASTER_DATA, 1 << CASCADE_IRQ);
            write(SLAVE_DATA, CASCADE_IRQ);
            write(MASTER_DATA, ICW4_8086);
            write(SLAVE_DATA, ICW4_8086);
        }
        self.apply_masks();
        log::debug!("PIC: IRQs remapped to {MASTER_OFFSET}..{}", SLAVE_OFFSET + 8);
    }

    /// Lets `irq` through. Unmasking a slave line also unmasks the cascade.
    pub fn unmask(&mut self, irq: u8) {
        assert!(irq < IRQ_COUNT, "IRQ {irq} does not exist");
        if irq >= 8 {
            self.masks[0] &= !(1 << CASCADE_IRQ);
            self.masks[1] &= !(1 << (irq - 8));
        } else {
            self.masks[0] &= !(1 << irq);
        }
        self.apply_masks();
    }

    pub fn mask(&mut self, irq: u8) {
        assert!(irq < IRQ_COUNT, "IRQ {irq} does not exist");
        if irq >= 8 {
            self.masks[1] |= 1 << (irq - 8);
        } else {
            self.masks[0] |= 1 << irq;
        }
        self.apply_masks();
    }

    pub fn masks(&self) -> [u8; 2] {
        self.masks
    }

    fn apply_masks(&self) {
        // SAFETY: See `init`.
        unsafe {
            arch::write_port8(MASTER_DATA, self.masks[0]);
            arch::write_port8(SLAVE_DATA, self.masks[1]);
        }
    }

    /// Acknowledges `irq` so the controller delivers further interrupts.
    ///
    /// Slave lines need an acknowledgment on both controllers.
    pub fn end_of_interrupt(&self, irq: u8) {
        // SAFETY: See `init`.
        unsafe {
            if irq >= 8 {
                arch::write_port8(SLAVE_COMMAND, EOI);
            }
            arch::write_port8(MASTER_COMMAND, EOI);
        }
    }

    /// Finishes a spurious `irq`: only the master is told, and only when the
    /// spurious line is on the slave.
    pub fn end_of_spurious(&self, irq: u8) {
        if irq >= 8 {
            // SAFETY: See `init`.
            unsafe { arch::write_port8(MASTER_COMMAND, EOI) };
        }
    }

    /// Returns true if `irq` is a spurious interrupt: the lowest-priority line
    /// of a controller raised without its in-service bit set.
    ///
    /// A spurious IRQ 7 must not be acknowledged; a spurious IRQ 15 must only be
    /// acknowledged on the master.
    pub fn is_spurious(&self, irq: u8) -> bool {
        let command = match irq {
            7 => MASTER_COMMAND,
            15 => SLAVE_COMMAND,
            _ => return false,
        };
        // SAFETY: OCW3 only selects which register the next read returns.
        let in_service = unsafe {
            arch::write_port8(command, OCW3_READ_ISR);
            arch::read_port8(command)
        };
        in_service & 0x80 == 0
    }
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn write(port: u16, value: u8) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        arch::write_port8(port, value);
        arch::write_port8(WAIT_PORT, 0);
    }
}
