//! Architecture-specific implementations for memory management.
//!
//! The i386 paging layout is always compiled. CR3, TLB and physical-memory access
//! come from the hardware backend on a bare-metal i386 build and from software
//! emulation everywhere else.

mod x86;
pub use x86::*;

// Use software emulation when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled, OR
// - building for anything other than bare-metal i386 (host tooling)
#[cfg(any(
    test,
    feature = "software-emulation",
    not(target_arch = "x86"),
    not(target_os = "none")
))]
mod software;
#[cfg(any(
    test,
    feature = "software-emulation",
    not(target_arch = "x86"),
    not(target_os = "none")
))]
pub use software::*;
