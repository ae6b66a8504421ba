//! The privilege segment table: a flat GDT and the TSS.
//!
//! All four code and data segments span the whole 4 GiB linear space. They
//! exist only to carry a privilege level; isolation is left to paging. The TSS
//! supplies the ring-0 stack the CPU switches to when an interrupt arrives in
//! ring 3.

use alloc::boxed::Box;

use bitflags::bitflags;
use pmm::VirtualAddress;
use x86_64::{PrivilegeLevel, structures::gdt::SegmentSelector};

use crate::arch::{self, DescriptorTablePointer};

pub const KERNEL_CODE: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
pub const KERNEL_DATA: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
pub const USER_CODE: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3);
pub const USER_DATA: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);
pub const TASK_STATE: SegmentSelector = SegmentSelector::new(5, PrivilegeLevel::Ring0);

const DESCRIPTOR_COUNT: usize = 6;

bitflags! {
    /// The access byte of a segment descriptor (bits 40-47).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const ACCESSED = 1 << 0;
        /// Readable for code, writable for data.
        const READ_WRITE = 1 << 1;
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Code or data rather than a system descriptor.
        const CODE_OR_DATA = 1 << 4;
        const DPL_LOW = 1 << 5;
        const DPL_HIGH = 1 << 6;
        const PRESENT = 1 << 7;

        /// System type for an available 32-bit TSS.
        const TSS_AVAILABLE = 0x9;
    }
}

impl Access {
    const fn with_dpl(self, dpl: PrivilegeLevel) -> Self {
        Self::from_bits_retain(self.bits() | ((dpl as u8) << 5))
    }

    fn dpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_u16(((self.bits() >> 5) & 0b11) as u16)
    }
}

/// Limit counted in 4 KiB units.
const FLAG_GRANULARITY: u8 = 0x8;
/// 32-bit default operand size.
const FLAG_32BIT: u8 = 0x4;

/// One 8-byte GDT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    pub const NULL: Self = Self(0);

    /// Builds a descriptor from its parts. `flags` is the upper nibble of byte 6.
    pub const fn new(base: u32, limit: u32, access: Access, flags: u8) -> Self {
        let base = base as u64;
        let limit = limit as u64;
        Self(
            (limit & 0xFFFF)
                | (base & 0xFF_FFFF) << 16
                | (access.bits() as u64) << 40
                | ((limit >> 16) & 0xF) << 48
                | ((flags & 0xF) as u64) << 52
                | ((base >> 24) & 0xFF) << 56,
        )
    }

    /// A flat 4 GiB segment.
    const fn flat(executable: bool, dpl: PrivilegeLevel) -> Self {
        let kind = if executable {
            Access::EXECUTABLE
        } else {
            Access::empty()
        };
        let access = Access::PRESENT
            .union(Access::CODE_OR_DATA)
            .union(Access::READ_WRITE)
            .union(kind)
            .with_dpl(dpl);
        Self::new(0, 0xF_FFFF, access, FLAG_GRANULARITY | FLAG_32BIT)
    }

    pub const fn code(dpl: PrivilegeLevel) -> Self {
        Self::flat(true, dpl)
    }

    pub const fn data(dpl: PrivilegeLevel) -> Self {
        Self::flat(false, dpl)
    }

    /// An available 32-bit TSS descriptor with byte granularity.
    pub const fn task_state(base: u32) -> Self {
        let access = Access::PRESENT.union(Access::TSS_AVAILABLE);
        Self::new(base, TSS_SIZE as u32 - 1, access, 0)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn access(self) -> Access {
        Access::from_bits_retain((self.0 >> 40) as u8)
    }

    pub fn base(self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32 | (((self.0 >> 56) as u32) << 24)
    }

    /// Returns the last valid offset in the segment, in bytes.
    pub fn limit(self) -> u32 {
        let raw = (self.0 & 0xFFFF) as u32 | (((self.0 >> 48) & 0xF) as u32) << 16;
        let flags = ((self.0 >> 52) & 0xF) as u8;
        if flags & FLAG_GRANULARITY != 0 {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    pub fn dpl(self) -> PrivilegeLevel {
        self.access().dpl()
    }

    pub fn is_present(self) -> bool {
        self.access().contains(Access::PRESENT)
    }

    fn is_writable_data(self) -> bool {
        let access = self.access();
        access.contains(Access::CODE_OR_DATA | Access::READ_WRITE)
            && !access.contains(Access::EXECUTABLE)
    }
}

const TSS_SIZE: usize = 104;

/// The 32-bit task state segment. Only `ss0:esp0` is used.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskStateSegment {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt: u32,
    pub trap: u16,
    pub iomap_base: u16,
}

const _: () = assert!(core::mem::size_of::<TaskStateSegment>() == TSS_SIZE);

/// The general-protection fault a segment register load would raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFault {
    pub selector: SegmentSelector,
}

impl SegmentFault {
    /// The error code the CPU pushes: the selector without its RPL bits.
    pub fn error_code(&self) -> u32 {
        (self.selector.0 & !0b11) as u32
    }
}

/// The GDT together with the TSS it describes.
///
/// The table is boxed so that the addresses handed to the CPU stay valid when
/// the owner moves.
pub struct SegmentTable {
    descriptors: [SegmentDescriptor; DESCRIPTOR_COUNT],
    tss: TaskStateSegment,
    installed: bool,
}

impl SegmentTable {
    pub fn new() -> Box<Self> {
        let mut table = Box::new(Self {
            descriptors: [
                SegmentDescriptor::NULL,
                SegmentDescriptor::code(PrivilegeLevel::Ring0),
                SegmentDescriptor::data(PrivilegeLevel::Ring0),
                SegmentDescriptor::code(PrivilegeLevel::Ring3),
                SegmentDescriptor::data(PrivilegeLevel::Ring3),
                SegmentDescriptor::NULL,
            ],
            tss: TaskStateSegment {
                ss0: KERNEL_DATA.0 as u32,
                iomap_base: TSS_SIZE as u16,
                ..TaskStateSegment::default()
            },
            installed: false,
        });
        let tss = &table.tss as *const TaskStateSegment as usize as u32;
        table.descriptors[TASK_STATE.index() as usize] = SegmentDescriptor::task_state(tss);
        table
    }

    /// Loads the GDT, reloads every segment register and loads the task register.
    ///
    /// # Panics
    /// Panics if called more than once.
    pub fn install(&mut self) {
        assert!(!self.installed, "segment table installed twice");
        let pointer = DescriptorTablePointer::of(&self.descriptors);
        // SAFETY: The table lives in a box owned by the kernel for the rest of
        // its life, and the selectors name its flat ring-0 segments and TSS.
        unsafe {
            arch::load_gdt(&pointer, KERNEL_CODE, KERNEL_DATA);
            arch::load_task_register(TASK_STATE);
        }
        self.installed = true;
        log::debug!("GDT loaded at {:#010x}", { pointer.base });
    }

    pub fn descriptor(&self, selector: SegmentSelector) -> Option<SegmentDescriptor> {
        self.descriptors.get(selector.index() as usize).copied()
    }

    /// Sets the stack the CPU switches to on a ring 3 to ring 0 transition.
    pub fn set_kernel_stack(&mut self, top: VirtualAddress) {
        self.tss.esp0 = top.as_u32();
    }

    pub fn kernel_stack(&self) -> VirtualAddress {
        VirtualAddress::new(self.tss.esp0)
    }

    /// Applies the rule for loading `selector` into DS, ES, FS or GS from code
    /// running at `cpl`: the target must be a present, writable data segment
    /// with `max(CPL, RPL) <= DPL`. The null selector may always be loaded.
    pub fn check_data_load(
        &self,
        selector: SegmentSelector,
        cpl: PrivilegeLevel,
    ) -> Result<(), SegmentFault> {
        if selector.index() == 0 {
            return Ok(());
        }
        let fault = Err(SegmentFault { selector });
        let Some(descriptor) = self.descriptor(selector) else {
            return fault;
        };
        if !descriptor.is_present() || !descriptor.is_writable_data() {
            return fault;
        }
        let effective = (cpl as u8).max(selector.rpl() as u8);
        if effective > descriptor.dpl() as u8 {
            return fault;
        }
        Ok(())
    }

    /// Applies the rule for loading SS: RPL and DPL must both equal CPL.
    pub fn check_stack_load(
        &self,
        selector: SegmentSelector,
        cpl: PrivilegeLevel,
    ) -> Result<(), SegmentFault> {
        let fault = Err(SegmentFault { selector });
        match self.descriptor(selector) {
            Some(descriptor)
                if selector.index() != 0
                    && descriptor.is_present()
                    && descriptor.is_writable_data()
                    && selector.rpl() == cpl
                    && descriptor.dpl() == cpl =>
            {
                Ok(())
            }
            _ => fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_carry_their_ring() {
        assert_eq!(KERNEL_CODE.0, 0x08);
        assert_eq!(KERNEL_DATA.0, 0x10);
        assert_eq!(USER_CODE.0, 0x1B);
        assert_eq!(USER_DATA.0, 0x23);
        assert_eq!(TASK_STATE.0, 0x28);
    }

    #[test]
    fn flat_descriptors_encode_bit_exact() {
        assert_eq!(SegmentDescriptor::code(PrivilegeLevel::Ring0).as_u64(), 0x00CF_9A00_0000_FFFF);
        assert_eq!(SegmentDescriptor::data(PrivilegeLevel::Ring0).as_u64(), 0x00CF_9200_0000_FFFF);
        assert_eq!(SegmentDescriptor::code(PrivilegeLevel::Ring3).as_u64(), 0x00CF_FA00_0000_FFFF);
        assert_eq!(SegmentDescriptor::data(PrivilegeLevel::Ring3).as_u64(), 0x00CF_F200_0000_FFFF);

        let data = SegmentDescriptor::data(PrivilegeLevel::Ring3);
        assert_eq!(data.base(), 0);
        assert_eq!(data.limit(), u32::MAX);
        assert_eq!(data.dpl(), PrivilegeLevel::Ring3);
    }

    #[test]
    fn task_state_descriptor_points_at_the_tss() {
        let descriptor = SegmentDescriptor::task_state(0xC012_3450);
        assert_eq!(descriptor.base(), 0xC012_3450);
        assert_eq!(descriptor.limit(), 103);
        assert_eq!(descriptor.access().bits(), 0x89);
        assert_eq!(descriptor.dpl(), PrivilegeLevel::Ring0);
    }

    #[test]
    fn install_loads_tables_once() {
        let mut table = SegmentTable::new();
        table.install();

        let loaded = arch::loaded_tables();
        let gdt = loaded.gdt.expect("gdt loaded");
        assert_eq!({ gdt.limit }, 47);
        assert_eq!(loaded.code_selector, Some(KERNEL_CODE));
        assert_eq!(loaded.data_selector, Some(KERNEL_DATA));
        assert_eq!(loaded.task_register, Some(TASK_STATE));

        let tss = table.descriptor(TASK_STATE).expect("tss descriptor");
        assert_eq!(tss.base(), &table.tss as *const TaskStateSegment as usize as u32);
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn second_install_panics() {
        let mut table = SegmentTable::new();
        table.install();
        table.install();
    }

    #[test]
    fn kernel_stack_is_recorded_in_the_tss() {
        let mut table = SegmentTable::new();
        table.set_kernel_stack(VirtualAddress::new(0xE000_3000));
        assert_eq!(table.kernel_stack(), VirtualAddress::new(0xE000_3000));
        assert_eq!(table.tss.ss0, 0x10);
    }

    #[test]
    fn ring_three_cannot_load_kernel_data() {
        let table = SegmentTable::new();
        let ring3 = PrivilegeLevel::Ring3;

        assert_eq!(table.check_data_load(USER_DATA, ring3), Ok(()));
        let fault = table
            .check_data_load(KERNEL_DATA, ring3)
            .expect_err("kernel data from ring 3");
        assert_eq!(fault.error_code(), 0x10);

        // Forging RPL 3 on the kernel selector from ring 0 does not help either.
        let forged = SegmentSelector::new(2, PrivilegeLevel::Ring3);
        assert!(table.check_data_load(forged, PrivilegeLevel::Ring0).is_err());

        assert_eq!(table.check_data_load(KERNEL_DATA, PrivilegeLevel::Ring0), Ok(()));
        assert_eq!(table.check_data_load(USER_DATA, PrivilegeLevel::Ring0), Ok(()));
        assert!(table.check_data_load(USER_CODE, ring3).is_err());
        assert!(table.check_data_load(SegmentSelector::new(9, ring3), ring3).is_err());
    }

    #[test]
    fn stack_segment_must_match_the_ring() {
        let table = SegmentTable::new();
        assert_eq!(table.check_stack_load(USER_DATA, PrivilegeLevel::Ring3), Ok(()));
        assert!(table.check_stack_load(KERNEL_DATA, PrivilegeLevel::Ring3).is_err());
        assert!(table.check_stack_load(USER_DATA, PrivilegeLevel::Ring0).is_err());
        assert!(table.check_stack_load(SegmentSelector(0), PrivilegeLevel::Ring0).is_err());
    }
}
