//! Interrupt entry stubs and the trap-return path.
//!
//! Every vector has a 16-byte stub. It masks interrupts (the gates are trap
//! gates), pushes a zero error code if the CPU did not push one, pushes the
//! vector number and joins the common path. The common path pushes the general
//! registers and the data segment registers, so the stack holds a
//! [`TrapFrame`](crate::interrupts::TrapFrame), clears the direction flag the
//! interrupted code may have set, and hands the frame's address to the
//! kernel. The kernel answers with the address of the frame to resume, which
//! may sit on a different stack.

use core::arch::{asm, global_asm};

use pmm::VirtualAddress;

const STUB_SIZE: u32 = 16;

unsafe extern "C" {
    static ringlet_trap_stubs: u8;
}

global_asm!(
    r#"
    .section .text
    .balign 16
    .globl ringlet_trap_stubs
ringlet_trap_stubs:
    .set vector, 0
    .rept 256
    .balign 16
    cli
    .if (vector == 8) || ((vector >= 10) && (vector <= 14)) || (vector == 17) || (vector == 21) || (vector == 29) || (vector == 30)
    .else
    pushl $0
    .endif
    pushl $vector
    jmp ringlet_trap_common
    .set vector, vector + 1
    .endr

ringlet_trap_common:
    pushal
    pushl %ds
    pushl %es
    pushl %fs
    pushl %gs
    movw ${data}, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    cld
    pushl %esp
    call {entry}
    movl %eax, %esp

    .globl ringlet_trap_return
ringlet_trap_return:
    popl %gs
    popl %fs
    popl %es
    popl %ds
    popal
    addl $8, %esp
    iret
    "#,
    data = const crate::segments::KERNEL_DATA.0,
    entry = sym trap_entry,
    options(att_syntax)
);

extern "C" fn trap_entry(frame: u32) -> u32 {
    crate::handle_trap(VirtualAddress::new(frame)).as_u32()
}

/// Returns the address of the entry stub for `vector`.
pub fn stub_address(vector: u8) -> u32 {
    &raw const ringlet_trap_stubs as usize as u32 + vector as u32 * STUB_SIZE
}

/// Leaves the kernel through the trap-return path, resuming the frame stored at
/// `frame`.
///
/// # Safety
/// `frame` must hold a complete trap frame for a process whose address space
/// is loaded and whose kernel stack top is in the TSS.
pub unsafe fn enter(frame: VirtualAddress) -> ! {
    // SAFETY: Forwarded to the caller.
    unsafe {
        asm!(
            "mov esp, {0}",
            "jmp ringlet_trap_return",
            in(reg) frame.as_u32(),
            options(noreturn)
        );
    }
}
