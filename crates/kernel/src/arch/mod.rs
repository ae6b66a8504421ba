//! CPU access for the kernel.
//!
//! Both backends export the same functions. The hardware backend executes the
//! privileged instructions; the software backend records their effects on a
//! per-thread model of the machine so that the rest of the kernel can be tested
//! on the host.

#[cfg(ringlet_hardware)]
mod x86;

#[cfg(ringlet_hardware)]
pub use x86::*;

#[cfg(not(ringlet_hardware))]
mod software;

#[cfg(not(ringlet_hardware))]
pub use software::*;

/// The operand of `lgdt` and `lidt` in 32-bit protected mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    /// Size of the table in bytes, minus one.
    pub limit: u16,
    /// Linear address of the table.
    pub base: u32,
}

impl DescriptorTablePointer {
    /// Describes the table stored in `table`.
    pub fn of<T>(table: &T) -> Self {
        Self {
            limit: (core::mem::size_of::<T>() - 1) as u16,
            base: table as *const T as usize as u32,
        }
    }
}
