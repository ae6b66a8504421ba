#![cfg_attr(ringlet_hardware, no_std, no_main)]

#[cfg(ringlet_hardware)]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    ringlet_kernel::handle_panic(info)
}

/// The kernel only boots on bare-metal i686. A host build has nothing to run.
#[cfg(not(ringlet_hardware))]
fn main() {
    eprintln!("ringlet is a kernel; build it for an i686 bare-metal target to boot it");
}
