//! Privileged i386 instructions.

use core::arch::asm;

use x86_64::structures::gdt::SegmentSelector;

use super::DescriptorTablePointer;

mod entry;
mod trap;

pub use entry::{boot_directory, boot_page_table, kernel_image};
pub use trap::{enter, stub_address};

/// Writes a byte to an I/O port.
///
/// # Safety
/// Port writes can reconfigure hardware arbitrarily.
#[inline]
pub unsafe fn write_port8(port: u16, value: u8) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }
}

/// Reads a byte from an I/O port.
///
/// # Safety
/// Port reads can have side effects on the device.
#[inline]
pub unsafe fn read_port8(port: u16) -> u8 {
    let value: u8;
    // SAFETY: Forwarded to the caller.
    unsafe {
        asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Loads the GDT and reloads every segment register from it.
///
/// CS can only be changed by a control transfer, so it is reloaded with a far
/// return to the next instruction.
///
/// # Safety
/// The table must stay at the same address for as long as it is loaded, and
/// `code` and `data` must select flat ring-0 segments in it.
pub unsafe fn load_gdt(pointer: &DescriptorTablePointer, code: SegmentSelector, data: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        asm!(
            "lgdt [{pointer}]",
            "push {code:e}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov fs, {data:x}",
            "mov gs, {data:x}",
            "mov ss, {data:x}",
            pointer = in(reg) pointer,
            code = in(reg) code.0 as u32,
            data = in(reg) data.0 as u32,
            tmp = out(reg) _,
        );
    }
}

/// Loads the task register.
///
/// # Safety
/// `selector` must refer to an available TSS descriptor in the loaded GDT.
pub unsafe fn load_task_register(selector: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        asm!("ltr {0:x}", in(reg) selector.0, options(nostack, preserves_flags));
    }
}

/// Loads the IDT.
///
/// # Safety
/// The table must stay at the same address for as long as it is loaded.
pub unsafe fn load_idt(pointer: &DescriptorTablePointer) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        asm!("lidt [{0}]", in(reg) pointer, options(readonly, nostack, preserves_flags));
    }
}

#[inline]
pub fn enable_interrupts() {
    // SAFETY: The IDT is installed before anything enables interrupts.
    unsafe { asm!("sti", options(nomem, nostack)) }
}

#[inline]
pub fn disable_interrupts() {
    // SAFETY: Masking interrupts cannot break memory safety.
    unsafe { asm!("cli", options(nomem, nostack)) }
}

pub fn interrupts_enabled() -> bool {
    let flags: u32;
    // SAFETY: Reads EFLAGS only.
    unsafe {
        asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & 0x200 != 0
}

/// Returns the linear address of the last page fault.
pub fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: Reading CR2 has no side effects.
    unsafe {
        asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Body of the idle process: wait for interrupts forever.
pub extern "C" fn idle() -> ! {
    loop {
        // SAFETY: Idle runs in ring 0 with the IDT installed.
        unsafe { asm!("sti", "hlt", options(nomem, nostack)) }
    }
}

/// Stops the CPU for good.
pub fn park() -> ! {
    loop {
        // SAFETY: Nothing runs after this.
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}
