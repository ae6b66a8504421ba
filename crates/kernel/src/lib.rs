#![cfg_attr(ringlet_hardware, no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod config;
pub mod console;
pub mod interrupts;
pub mod kernel;
pub mod mem;
pub mod modules;
pub mod pic;
pub mod process;
pub mod scheduler;
pub mod segments;
#[cfg(ringlet_hardware)]
mod serial;
pub mod syscall;
pub mod timer;

#[cfg(ringlet_hardware)]
use alloc::{string::String, vec::Vec};

#[cfg(ringlet_hardware)]
use pmm::{FrameAllocator, PageDirectory, PhysicalAddress, PhysicalFrame, TemporaryWindow, VirtualAddress};
#[cfg(ringlet_hardware)]
use spin::{Mutex, Once};

#[cfg(ringlet_hardware)]
use crate::{boot::BootInfo, config::KernelConfig, console::Console, kernel::Kernel, mem::KernelMemory};

#[cfg(ringlet_hardware)]
static KERNEL: Once<Mutex<Kernel<TemporaryWindow>>> = Once::new();

/// Brings the machine from the multiboot handoff to the first process.
#[cfg(ringlet_hardware)]
pub fn kernel_main(magic: u32, info: PhysicalAddress) -> ! {
    // SAFETY: This is the first thing the kernel does, and it does it once.
    unsafe {
        mem::init_heap();
    }
    let console = Console::init(KernelConfig::DEFAULT.log_level);
    serial::init(console);

    // SAFETY: The boot page table maps the start of the kernel half in every
    // address space, and nothing else uses its last entry.
    let mut window = unsafe { TemporaryWindow::new(arch::boot_page_table()) };
    let boot = match BootInfo::parse(&mut window, magic, info) {
        Ok(boot) => boot,
        Err(err) => panic!("bad boot handoff: {err}"),
    };
    let config = KernelConfig::from_command_line(boot.command_line());
    log::set_max_level(config.log_level);
    log::debug!("{config:?}");

    let (kernel_start, kernel_size) = arch::kernel_image();
    let frames = FrameAllocator::new(&boot.memory_map(kernel_start, kernel_size));
    let directory = PageDirectory::from_root(PhysicalFrame::containing(arch::boot_directory()));
    let memory = KernelMemory::new(window, frames, directory);

    let mut kernel = match Kernel::new(config, memory) {
        Ok(kernel) => kernel,
        Err(err) => panic!("cannot set up the process table: {err}"),
    };
    if let Err(err) = kernel.install() {
        panic!("cannot program the timer: {err}");
    }
    for image in boot.programs() {
        kernel.register_program(image);
    }

    let idle = VirtualAddress::new(arch::idle as usize as u32);
    if let Err(err) = kernel.spawn_idle(idle) {
        panic!("cannot create the idle process: {err}");
    }
    let names: Vec<String> = kernel.programs().iter().map(|image| image.name().into()).collect();
    for name in names {
        match kernel.spawn(&name) {
            Ok(id) => log::info!("{id}: {name}"),
            Err(err) => log::error!("cannot start {name}: {err}"),
        }
    }

    let frame = kernel.start();
    KERNEL.call_once(|| Mutex::new(kernel));
    // SAFETY: `start` activated the first process and built its frame.
    unsafe { arch::enter(frame) }
}

/// Entered from the trap stubs with the address of the frame they built.
#[cfg(ringlet_hardware)]
pub fn handle_trap(frame: VirtualAddress) -> VirtualAddress {
    let Some(kernel) = KERNEL.get() else {
        panic!("trap at {frame} before the kernel started");
    };
    let Some(mut kernel) = kernel.try_lock() else {
        panic!("trap while the kernel lock is held");
    };
    kernel.handle_trap(frame)
}

#[cfg(ringlet_hardware)]
pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    arch::disable_interrupts();
    log::error!("kernel panic: {info}");
    arch::park()
}
