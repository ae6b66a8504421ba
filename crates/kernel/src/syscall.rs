//! The system call interface.
//!
//! User code raises `int 0x80` with the call number in `eax` and arguments in
//! `ebx` and `ecx`. The result comes back in `eax`; failures return
//! [`ERROR`].

use pmm::{PhysicalMemory, VirtualAddress};

use crate::{interrupts::InterruptContext, kernel::Kernel};

pub const YIELD: u32 = 1;
pub const FORK: u32 = 2;
pub const EXEC: u32 = 3;
pub const EXIT: u32 = 4;
pub const GETPID: u32 = 5;

/// The value returned in `eax` when a call fails.
pub const ERROR: u32 = u32::MAX;

/// Longest path `exec` accepts.
pub const MAX_PATH: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Yield,
    Fork,
    Exec { path: VirtualAddress, len: u32 },
    Exit,
    GetPid,
}

impl Syscall {
    pub fn decode(eax: u32, ebx: u32, ecx: u32) -> Option<Self> {
        let call = match eax {
            YIELD => Syscall::Yield,
            FORK => Syscall::Fork,
            EXEC => Syscall::Exec {
                path: VirtualAddress::new(ebx),
                len: ecx,
            },
            EXIT => Syscall::Exit,
            GETPID => Syscall::GetPid,
            _ => return None,
        };
        Some(call)
    }
}

/// The handler behind the syscall vector.
pub fn dispatch<M: PhysicalMemory>(kernel: &mut Kernel<M>, context: &mut InterruptContext) {
    let registers = context.registers;
    let Some(caller) = kernel.current() else {
        log::warn!("system call with no current process");
        context.registers.eax = ERROR;
        return;
    };
    let Some(call) = Syscall::decode(registers.eax, registers.ebx, registers.ecx) else {
        log::debug!("{caller}: unknown system call {}", registers.eax);
        context.registers.eax = ERROR;
        return;
    };
    log::trace!("{caller}: {call:?}");

    match call {
        Syscall::Yield => {
            context.registers.eax = 0;
            kernel.reschedule(context);
        }
        Syscall::Fork => {
            context.registers.eax = match kernel.fork_current(context) {
                Ok(child) => child.as_u32(),
                Err(err) => {
                    log::warn!("{caller}: fork failed: {err}");
                    ERROR
                }
            };
            kernel.reschedule(context);
        }
        Syscall::Exec { path, len } => {
            if let Err(err) = kernel.exec_current(context, path, len) {
                log::warn!("{caller}: exec failed: {err}");
                context.registers.eax = ERROR;
            }
            kernel.reschedule(context);
        }
        Syscall::Exit => kernel.exit_current(context),
        Syscall::GetPid => context.registers.eax = caller.as_u32(),
    }
}
