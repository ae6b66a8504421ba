//! A recording model of the CPU for host builds.
//!
//! Every privileged operation updates thread-local state instead of touching
//! hardware. Tests read that state back to check what the kernel asked the
//! machine to do.

use std::{cell::RefCell, collections::BTreeMap, vec::Vec};

use x86_64::structures::gdt::SegmentSelector;

use super::DescriptorTablePointer;

/// One `out` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortWrite {
    pub port: u16,
    pub value: u8,
}

/// The descriptor-table registers as last loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadedTables {
    pub gdt: Option<DescriptorTablePointer>,
    pub idt: Option<DescriptorTablePointer>,
    pub code_selector: Option<SegmentSelector>,
    pub data_selector: Option<SegmentSelector>,
    pub task_register: Option<SegmentSelector>,
}

#[derive(Default)]
struct Machine {
    port_writes: Vec<PortWrite>,
    port_inputs: BTreeMap<u16, u8>,
    tables: LoadedTables,
    interrupts_enabled: bool,
    cr2: u32,
}

std::thread_local! {
    static MACHINE: RefCell<Machine> = RefCell::new(Machine::default());
}

fn with_machine<R>(f: impl FnOnce(&mut Machine) -> R) -> R {
    MACHINE.with(|machine| f(&mut machine.borrow_mut()))
}

/// Records a byte written to an I/O port.
///
/// # Safety
/// Always safe in emulation.
pub unsafe fn write_port8(port: u16, value: u8) {
    with_machine(|m| m.port_writes.push(PortWrite { port, value }));
}

/// Reads the value scripted for `port`, or `0xFF` (a floating bus).
///
/// # Safety
/// Always safe in emulation.
pub unsafe fn read_port8(port: u16) -> u8 {
    with_machine(|m| m.port_inputs.get(&port).copied().unwrap_or(0xFF))
}

/// Records a GDT load followed by a reload of every segment register.
///
/// # Safety
/// Always safe in emulation.
pub unsafe fn load_gdt(
    pointer: &DescriptorTablePointer,
    code: SegmentSelector,
    data: SegmentSelector,
) {
    with_machine(|m| {
        m.tables.gdt = Some(*pointer);
        m.tables.code_selector = Some(code);
        m.tables.data_selector = Some(data);
    });
}

/// Records a task register load.
///
/// # Safety
/// Always safe in emulation.
pub unsafe fn load_task_register(selector: SegmentSelector) {
    with_machine(|m| m.tables.task_register = Some(selector));
}

/// Records an IDT load.
///
/// # Safety
/// Always safe in emulation.
pub unsafe fn load_idt(pointer: &DescriptorTablePointer) {
    with_machine(|m| m.tables.idt = Some(*pointer));
}

pub fn enable_interrupts() {
    with_machine(|m| m.interrupts_enabled = true);
}

pub fn disable_interrupts() {
    with_machine(|m| m.interrupts_enabled = false);
}

pub fn interrupts_enabled() -> bool {
    with_machine(|m| m.interrupts_enabled)
}

/// Returns the faulting address recorded by [`set_cr2`].
pub fn read_cr2() -> u32 {
    with_machine(|m| m.cr2)
}

/// Returns a distinct fake address for the entry stub of `vector`.
pub fn stub_address(vector: u8) -> u32 {
    0xC010_0000 + vector as u32 * 16
}

/// Sets the value the next page fault reports in CR2.
pub fn set_cr2(address: u32) {
    with_machine(|m| m.cr2 = address);
}

/// Makes reads from `port` return `value`.
pub fn set_port_input(port: u16, value: u8) {
    with_machine(|m| {
        m.port_inputs.insert(port, value);
    });
}

/// Returns and clears the port writes recorded on this thread.
pub fn take_port_writes() -> Vec<PortWrite> {
    with_machine(|m| core::mem::take(&mut m.port_writes))
}

/// Returns the descriptor tables loaded on this thread.
pub fn loaded_tables() -> LoadedTables {
    with_machine(|m| m.tables)
}
