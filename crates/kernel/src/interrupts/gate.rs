//! The interrupt descriptor table.

use alloc::boxed::Box;

use x86_64::{PrivilegeLevel, structures::gdt::SegmentSelector};

use super::InterruptVector;
use crate::{
    arch::{self, DescriptorTablePointer},
    segments::KERNEL_CODE,
};

pub const VECTOR_COUNT: usize = 256;

const GATE_PRESENT: u64 = 1 << 47;
const GATE_TRAP_32: u64 = 0xF << 40;

/// One 8-byte IDT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct GateDescriptor(u64);

impl GateDescriptor {
    pub const MISSING: Self = Self(0);

    /// A present 32-bit trap gate. Trap gates leave IF alone on entry.
    pub const fn trap(handler: u32, selector: SegmentSelector, dpl: PrivilegeLevel) -> Self {
        let handler = handler as u64;
        Self(
            (handler & 0xFFFF)
                | (selector.0 as u64) << 16
                | GATE_TRAP_32
                | (dpl as u64) << 45
                | GATE_PRESENT
                | (handler >> 16) << 48,
        )
    }

    pub fn handler(self) -> u32 {
        (self.0 & 0xFFFF) as u32 | ((self.0 >> 48) as u32) << 16
    }

    pub fn selector(self) -> SegmentSelector {
        SegmentSelector((self.0 >> 16) as u16)
    }

    pub fn dpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_u16(((self.0 >> 45) & 0b11) as u16)
    }

    pub fn is_present(self) -> bool {
        self.0 & GATE_PRESENT != 0
    }

    pub fn is_trap_gate(self) -> bool {
        self.0 & (0xF << 40) == GATE_TRAP_32
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A gate for every vector, each pointing at its entry stub.
#[repr(C, align(8))]
pub struct InterruptDescriptorTable {
    gates: [GateDescriptor; VECTOR_COUNT],
}

impl InterruptDescriptorTable {
    /// Builds the table. Only the syscall gate may be raised with `int` from
    /// ring 3; every other vector faults with #GP if user code tries.
    pub fn new() -> Box<Self> {
        let mut table = Box::new(Self {
            gates: [GateDescriptor::MISSING; VECTOR_COUNT],
        });
        for (vector, gate) in table.gates.iter_mut().enumerate() {
            let vector = InterruptVector::new(vector as u8);
            let dpl = if vector == InterruptVector::SYSCALL {
                PrivilegeLevel::Ring3
            } else {
                PrivilegeLevel::Ring0
            };
            *gate = GateDescriptor::trap(arch::stub_address(vector.value()), KERNEL_CODE, dpl);
        }
        table
    }

    pub fn gate(&self, vector: InterruptVector) -> GateDescriptor {
        self.gates[vector.value() as usize]
    }

    /// Loads the table into the IDT register.
    pub fn load(&self) {
        let pointer = DescriptorTablePointer::of(&self.gates);
        // SAFETY: The table is boxed and owned by the kernel, which never drops it.
        unsafe { arch::load_idt(&pointer) };
        log::debug!("IDT loaded with {VECTOR_COUNT} trap gates");
    }
}
