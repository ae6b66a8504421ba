//! Multiboot entry point.
//!
//! The bootloader jumps to `_start` in protected mode with paging off, the
//! multiboot magic in EAX and the physical address of the info structure in
//! EBX. The code below maps the first 4 MiB of physical memory both at 0 and at
//! `0xC000_0000`, turns on paging, jumps to the higher half, drops the identity
//! mapping and calls [`crate::kernel_main`] on the boot stack.

use core::arch::global_asm;

use pmm::{KERNEL_BASE, PageTable, PhysicalAddress};

const BOOT_STACK_SIZE: usize = 16 * 1024;

/// Physical address the bootloader loads the image at.
const LOAD_ADDRESS: u32 = 0x0010_0000;

#[repr(C, align(4096))]
struct BootStack([u8; BOOT_STACK_SIZE]);

static mut BOOT_DIRECTORY: PageTable = PageTable::EMPTY;
static mut BOOT_TABLE: PageTable = PageTable::EMPTY;
static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

unsafe extern "C" {
    static __kernel_end: u8;
}

global_asm!(
    r#"
    .section .multiboot, "a"
    .balign 4
    .long 0x1BADB002
    .long 0x00000003
    .long -(0x1BADB002 + 0x00000003)

    .section .boot.text, "ax"
    .globl _start
_start:
    cli
    movl $({table} - 0xC0000000), %edi
    movl $0x003, %esi
    movl $1023, %ecx
1:
    movl %esi, (%edi)
    addl $0x1000, %esi
    addl $4, %edi
    loop 1b
    movl $0, (%edi)

    movl $({table} - 0xC0000000 + 0x003), %edx
    movl %edx, ({directory} - 0xC0000000)
    movl %edx, ({directory} - 0xC0000000 + 768 * 4)

    movl $({directory} - 0xC0000000), %ecx
    movl %ecx, %cr3
    movl %cr0, %ecx
    orl $0x80000000, %ecx
    movl %ecx, %cr0

    movl $2f, %ecx
    jmp *%ecx

    .section .text
2:
    movl $0, {directory}
    movl %cr3, %ecx
    movl %ecx, %cr3

    movl $({stack} + {stack_size}), %esp
    xorl %ebp, %ebp
    pushl %ebx
    pushl %eax
    cld
    call {main}
3:
    cli
    hlt
    jmp 3b
    "#,
    table = sym BOOT_TABLE,
    directory = sym BOOT_DIRECTORY,
    stack = sym BOOT_STACK,
    stack_size = const BOOT_STACK_SIZE,
    main = sym kernel_entry,
    options(att_syntax)
);

extern "C" fn kernel_entry(magic: u32, info: u32) -> ! {
    crate::kernel_main(magic, PhysicalAddress::new(info))
}

/// Returns the boot page table. It maps the first 4 MiB of the kernel half,
/// and its last entry is the temporary mapping window.
pub fn boot_page_table() -> *mut PageTable {
    &raw mut BOOT_TABLE
}

/// Returns the physical address of the boot page directory.
pub fn boot_directory() -> PhysicalAddress {
    PhysicalAddress::new(&raw const BOOT_DIRECTORY as usize as u32 - KERNEL_BASE)
}

/// Returns the physical range occupied by the kernel image, `.bss` included.
pub fn kernel_image() -> (PhysicalAddress, u32) {
    let end = &raw const __kernel_end as usize as u32 - KERNEL_BASE;
    (PhysicalAddress::new(LOAD_ADDRESS), end - LOAD_ADDRESS)
}
