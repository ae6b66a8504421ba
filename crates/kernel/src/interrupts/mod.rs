//! Interrupt and exception dispatch.
//!
//! Every vector enters the kernel through the same path: the entry stub saves a
//! [`TrapFrame`], the kernel captures it as a [`RegisterSnapshot`] inside an
//! [`InterruptContext`] and passes the context to the handler registered for
//! the vector. Whatever snapshot the context holds when the handler returns is
//! what the trap-return path resumes.

use pmm::VirtualAddress;
use x86_64::structures::idt::PageFaultErrorCode;

mod frame;
mod gate;

pub use frame::{EFLAGS_INTERRUPTS_ENABLED, RegisterSnapshot, ResumePlan, TrapFrame};
pub use gate::{GateDescriptor, InterruptDescriptorTable, VECTOR_COUNT};

use crate::{kernel::Kernel, pic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// A CPU exception (vectors 0-31).
    Exception,
    PageFault {
        faulting_address: VirtualAddress,
        error: PageFaultErrorCode,
    },
    /// A PIC line (vectors 32-47).
    Hardware { irq: u8 },
    /// Anything raised with `int`.
    Software,
}

impl InterruptKind {
    /// Classifies `vector`, reading CR2 through `faulting_address` for page faults.
    pub fn classify(vector: InterruptVector, error_code: u32, faulting_address: impl FnOnce() -> u32) -> Self {
        if vector == InterruptVector::PAGE_FAULT {
            return InterruptKind::PageFault {
                faulting_address: VirtualAddress::new(faulting_address()),
                error: PageFaultErrorCode::from_bits_truncate(error_code as u64),
            };
        }
        if vector.is_exception() {
            return InterruptKind::Exception;
        }
        match pic::irq_for(vector) {
            Some(irq) => InterruptKind::Hardware { irq },
            None => InterruptKind::Software,
        }
    }
}

/// One interrupt occurrence, as seen by a handler.
#[derive(Debug, Clone)]
pub struct InterruptContext {
    vector: InterruptVector,
    error_code: u32,
    kind: InterruptKind,
    /// The state to resume. Handlers that switch contexts replace it.
    pub registers: RegisterSnapshot,
}

impl InterruptContext {
    pub fn new(
        vector: InterruptVector,
        error_code: u32,
        kind: InterruptKind,
        registers: RegisterSnapshot,
    ) -> Self {
        Self {
            vector,
            error_code,
            kind,
            registers,
        }
    }

    pub fn vector(&self) -> InterruptVector {
        self.vector
    }

    /// Returns the error code the CPU pushed, or zero if it pushed none.
    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    pub fn kind(&self) -> &InterruptKind {
        &self.kind
    }

    /// Returns the instruction pointer at the time of the interrupt.
    pub fn instruction_pointer(&self) -> VirtualAddress {
        self.registers.instruction_pointer()
    }

    /// Returns the stack pointer at the time of the interrupt.
    pub fn stack_pointer(&self) -> VirtualAddress {
        self.registers.stack_pointer()
    }
}

/// A handler for one vector.
pub type Handler<M> = fn(&mut Kernel<M>, &mut InterruptContext);

/// The handler registered for each vector.
pub struct HandlerTable<M: pmm::PhysicalMemory> {
    handlers: [Option<Handler<M>>; VECTOR_COUNT],
}

impl<M: pmm::PhysicalMemory> HandlerTable<M> {
    pub fn new() -> Self {
        Self {
            handlers: [None; VECTOR_COUNT],
        }
    }

    /// Registers `handler` for `vector`, returning the handler it replaces.
    pub fn register(&mut self, vector: InterruptVector, handler: Handler<M>) -> Option<Handler<M>> {
        self.handlers[vector.value() as usize].replace(handler)
    }

    pub fn get(&self, vector: InterruptVector) -> Option<Handler<M>> {
        self.handlers[vector.value() as usize]
    }
}

impl<M: pmm::PhysicalMemory> Default for HandlerTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

crate::interrupt_vectors! {
    u8,
    DIVIDE_ERROR = 0,
    DEBUG = 1,
    NON_MASKABLE_INTERRUPT = 2,
    BREAKPOINT = 3,
    OVERFLOW = 4,
    BOUND_RANGE_EXCEEDED = 5,
    INVALID_OPCODE = 6,
    DEVICE_NOT_AVAILABLE = 7,
    DOUBLE_FAULT = 8,
    COPROCESSOR_SEGMENT_OVERRUN = 9,
    INVALID_TSS = 10,
    SEGMENT_NOT_PRESENT = 11,
    STACK_SEGMENT_FAULT = 12,
    GENERAL_PROTECTION_FAULT = 13,
    PAGE_FAULT = 14,
    X87_FLOATING_POINT_EXCEPTION = 16,
    ALIGNMENT_CHECK = 17,
    MACHINE_CHECK = 18,
    SIMD_FLOATING_POINT_EXCEPTION = 19,
    VIRTUALIZATION_EXCEPTION = 20,
    CONTROL_PROTECTION_EXCEPTION = 21,
    TIMER = 32,
    SYSCALL = 0x80,
}

impl InterruptVector {
    /// Returns true for the vectors reserved for CPU exceptions.
    pub const fn is_exception(&self) -> bool {
        self.0 < 32
    }
}

#[macro_export]
macro_rules! interrupt_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// Represents an interrupt vector.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct InterruptVector($storage);

        impl InterruptVector {
            $(
                pub const $name: Self = Self($value);
            )*

            /// Creates a new interrupt vector from a raw value.
            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            /// Returns the raw value of the interrupt vector.
            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the interrupt vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "InterruptVector::{}({})", name, self.0)
                } else {
                    write!(f, "InterruptVector({})", self.0)
                }
            }
        }

        impl core::fmt::Display for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    }
}
