//! Trap frames and register snapshots.
//!
//! A [`TrapFrame`] is the exact stack layout the entry stubs build on top of
//! what the CPU pushes. A [`RegisterSnapshot`] is the complete machine state
//! of an interrupted context, independent of where the frame was found. The
//! scheduler only ever deals in snapshots; [`ResumePlan`] turns a snapshot back
//! into a frame at the address the trap-return path will pop it from.

use pmm::VirtualAddress;
use x86_64::PrivilegeLevel;

use crate::segments::{KERNEL_CODE, KERNEL_DATA, USER_CODE, USER_DATA};

/// EFLAGS with IF set and the always-one bit 1.
pub const EFLAGS_INTERRUPTS_ENABLED: u32 = 0x202;

const WORDS_KERNEL: usize = 17;
const WORDS_USER: usize = 19;

/// The saved state at trap entry, lowest address first.
///
/// `user_esp` and `user_ss` are only pushed by the CPU when the trap came from
/// ring 3; for a same-privilege trap they belong to whatever was on the
/// interrupted stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// ESP as stored by `pushal`; ignored on return.
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

const _: () = assert!(core::mem::size_of::<TrapFrame>() == TrapFrame::USER_SIZE as usize);

impl TrapFrame {
    /// Bytes in a frame for a trap that did not change privilege.
    pub const KERNEL_SIZE: u32 = (WORDS_KERNEL * 4) as u32;
    /// Bytes in a frame for a trap from ring 3.
    pub const USER_SIZE: u32 = (WORDS_USER * 4) as u32;

    /// Returns true if the frame returns to ring 3.
    pub fn is_user(&self) -> bool {
        self.cs & 0b11 == 3
    }

    /// Returns the number of bytes this frame occupies on the stack.
    pub fn size(&self) -> u32 {
        if self.is_user() {
            Self::USER_SIZE
        } else {
            Self::KERNEL_SIZE
        }
    }

    fn words(&self) -> [u32; WORDS_USER] {
        [
            self.gs,
            self.fs,
            self.es,
            self.ds,
            self.edi,
            self.esi,
            self.ebp,
            self.esp_dummy,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.vector,
            self.error_code,
            self.eip,
            self.cs,
            self.eflags,
            self.user_esp,
            self.user_ss,
        ]
    }

    /// Serialises the frame as it sits on the stack, `size()` bytes long.
    pub fn to_bytes(&self) -> ([u8; Self::USER_SIZE as usize], usize) {
        let mut bytes = [0u8; Self::USER_SIZE as usize];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        (bytes, self.size() as usize)
    }

    /// Parses a frame from stack bytes.
    ///
    /// `bytes` must hold at least [`TrapFrame::KERNEL_SIZE`] bytes, and
    /// [`TrapFrame::USER_SIZE`] if the saved CS is a ring-3 selector.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = [0u32; WORDS_USER];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let [
            gs,
            fs,
            es,
            ds,
            edi,
            esi,
            ebp,
            esp_dummy,
            ebx,
            edx,
            ecx,
            eax,
            vector,
            error_code,
            eip,
            cs,
            eflags,
            user_esp,
            user_ss,
        ] = words;
        let mut frame = Self {
            gs,
            fs,
            es,
            ds,
            edi,
            esi,
            ebp,
            esp_dummy,
            ebx,
            edx,
            ecx,
            eax,
            vector,
            error_code,
            eip,
            cs,
            eflags,
            user_esp,
            user_ss,
        };
        if !frame.is_user() {
            frame.user_esp = 0;
            frame.user_ss = 0;
        }
        frame
    }
}

/// The complete register state of a context that is not running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
}

impl RegisterSnapshot {
    /// Initial state of a ring-3 context.
    pub fn user(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        let data = USER_DATA.0 as u32;
        Self {
            eip: entry.as_u32(),
            esp: stack_top.as_u32(),
            eflags: EFLAGS_INTERRUPTS_ENABLED,
            cs: USER_CODE.0 as u32,
            ss: data,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ..Self::default()
        }
    }

    /// Initial state of a ring-0 context running on `stack_top`.
    pub fn kernel(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        let data = KERNEL_DATA.0 as u32;
        Self {
            eip: entry.as_u32(),
            esp: stack_top.as_u32(),
            eflags: EFLAGS_INTERRUPTS_ENABLED,
            cs: KERNEL_CODE.0 as u32,
            ss: data,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ..Self::default()
        }
    }

    /// Reconstructs the interrupted state from a frame found at `address`.
    ///
    /// For a same-privilege trap the CPU did not switch stacks, so the
    /// interrupted ESP is the address just above the frame and SS is unchanged.
    pub fn capture(frame: &TrapFrame, address: VirtualAddress) -> Self {
        let (esp, ss) = if frame.is_user() {
            (frame.user_esp, frame.user_ss)
        } else {
            (address.as_u32() + TrapFrame::KERNEL_SIZE, KERNEL_DATA.0 as u32)
        };
        Self {
            eax: frame.eax,
            ebx: frame.ebx,
            ecx: frame.ecx,
            edx: frame.edx,
            esi: frame.esi,
            edi: frame.edi,
            ebp: frame.ebp,
            esp,
            eip: frame.eip,
            eflags: frame.eflags,
            cs: frame.cs,
            ss,
            ds: frame.ds,
            es: frame.es,
            fs: frame.fs,
            gs: frame.gs,
        }
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_u16((self.cs & 0b11) as u16)
    }

    pub fn is_user(&self) -> bool {
        self.privilege() == PrivilegeLevel::Ring3
    }

    pub fn instruction_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.eip)
    }

    pub fn stack_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.esp)
    }
}

/// Where and what to write so that the trap-return path resumes a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePlan {
    pub address: VirtualAddress,
    pub frame: TrapFrame,
}

impl ResumePlan {
    /// Plans the return into `registers`.
    ///
    /// A ring-3 context gets a full frame at the top of its kernel stack, which
    /// is where the CPU will have switched to. A ring-0 context gets a short
    /// frame written just below its saved ESP, because `iret` without a
    /// privilege change leaves ESP wherever the popped frame ended.
    ///
    /// Returns `None` for a ring-3 context with no kernel stack.
    pub fn new(registers: &RegisterSnapshot, kernel_stack_top: Option<VirtualAddress>) -> Option<Self> {
        let mut frame = TrapFrame {
            gs: registers.gs,
            fs: registers.fs,
            es: registers.es,
            ds: registers.ds,
            edi: registers.edi,
            esi: registers.esi,
            ebp: registers.ebp,
            esp_dummy: 0,
            ebx: registers.ebx,
            edx: registers.edx,
            ecx: registers.ecx,
            eax: registers.eax,
            vector: 0,
            error_code: 0,
            eip: registers.eip,
            cs: registers.cs,
            eflags: registers.eflags,
            user_esp: 0,
            user_ss: 0,
        };

        let address = if registers.is_user() {
            frame.user_esp = registers.esp;
            frame.user_ss = registers.ss;
            kernel_stack_top? - TrapFrame::USER_SIZE
        } else {
            VirtualAddress::new(registers.esp - TrapFrame::KERNEL_SIZE)
        };
        Some(Self { address, frame })
    }

    /// Returns the first address above the written frame.
    pub fn end(&self) -> VirtualAddress {
        self.address + self.frame.size()
    }
}
