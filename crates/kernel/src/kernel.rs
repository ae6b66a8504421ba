//! The kernel context.
//!
//! [`Kernel`] owns every piece of global machine state: memory, the descriptor
//! tables, the interrupt controller and timer, the process table and the
//! scheduler. Trap handling is a function from the frame the entry stub built
//! to the address of the frame the trap-return path should pop next.

use alloc::boxed::Box;

use pmm::{PageFault, PhysicalMemory, VirtualAddress};

use crate::{
    arch,
    config::KernelConfig,
    interrupts::{
        Handler, HandlerTable, InterruptContext, InterruptDescriptorTable, InterruptKind,
        InterruptVector, RegisterSnapshot, ResumePlan, TrapFrame,
    },
    mem::KernelMemory,
    modules::{ProgramImage, ProgramRegistry},
    pic::{self, Pic},
    process::{ProcessError, ProcessId, ProcessTable},
    scheduler::Scheduler,
    segments::SegmentTable,
    syscall,
    timer::{Timer, TimerError},
};

pub struct Kernel<M: PhysicalMemory> {
    config: KernelConfig,
    memory: KernelMemory<M>,
    segments: Box<SegmentTable>,
    idt: Box<InterruptDescriptorTable>,
    handlers: HandlerTable<M>,
    pic: Pic,
    timer: Timer,
    processes: ProcessTable,
    scheduler: Scheduler,
    programs: ProgramRegistry,
}

impl<M: PhysicalMemory> Kernel<M> {
    /// Builds the kernel context. Nothing is loaded into the CPU until
    /// [`Kernel::install`].
    pub fn new(config: KernelConfig, mut memory: KernelMemory<M>) -> Result<Self, ProcessError> {
        let processes = ProcessTable::new(&mut memory, &config)?;
        let mut handlers = HandlerTable::<M>::new();
        handlers.register(InterruptVector::TIMER, timer_interrupt);
        handlers.register(InterruptVector::SYSCALL, syscall::dispatch);
        Ok(Self {
            config,
            memory,
            segments: SegmentTable::new(),
            idt: InterruptDescriptorTable::new(),
            handlers,
            pic: Pic::new(),
            timer: Timer::new(),
            processes,
            scheduler: Scheduler::new(),
            programs: ProgramRegistry::new(),
        })
    }

    /// Loads the GDT, TSS and IDT, remaps the PIC and starts the timer.
    pub fn install(&mut self) -> Result<(), TimerError> {
        arch::disable_interrupts();
        self.segments.install();
        self.idt.load();
        self.pic.init();
        self.timer.set_interval(self.config.timer_interval_ms)?;
        self.pic.unmask(pic::TIMER_IRQ);
        log::info!(
            "interrupts ready; preempting every {} ms",
            self.config.timer_interval_ms
        );
        Ok(())
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn memory(&self) -> &KernelMemory<M> {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut KernelMemory<M> {
        &mut self.memory
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub fn pic(&self) -> &Pic {
        &self.pic
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.scheduler.current()
    }

    /// Routes `vector` to `handler`, returning the handler it replaces.
    pub fn register_handler(
        &mut self,
        vector: InterruptVector,
        handler: Handler<M>,
    ) -> Option<Handler<M>> {
        self.handlers.register(vector, handler)
    }

    pub fn register_program(&mut self, image: ProgramImage) {
        self.programs.register(image);
    }

    /// Creates a user process running the program registered as `path` and
    /// queues it.
    pub fn spawn(&mut self, path: &str) -> Result<ProcessId, ProcessError> {
        let image = self.programs.get(path).ok_or(ProcessError::ImageNotFound)?;
        let id = self.processes.spawn(&mut self.memory, image)?;
        self.scheduler.enqueue(id);
        Ok(id)
    }

    /// Creates a ring-0 process entered at `entry` and queues it.
    pub fn spawn_kernel(&mut self, entry: VirtualAddress) -> Result<ProcessId, ProcessError> {
        let id = self.processes.create_kernel(&mut self.memory, entry)?;
        self.scheduler.enqueue(id);
        Ok(id)
    }

    /// Creates the process that runs when nothing else is ready.
    pub fn spawn_idle(&mut self, entry: VirtualAddress) -> Result<ProcessId, ProcessError> {
        let id = self.processes.create_kernel(&mut self.memory, entry)?;
        self.scheduler.set_idle(id);
        log::debug!("{id}: idle");
        Ok(id)
    }

    /// Picks the first process and returns the frame to enter it through.
    ///
    /// # Panics
    /// Panics if there is nothing to run.
    pub fn start(&mut self) -> VirtualAddress {
        let mut registers = RegisterSnapshot::default();
        let switch = self.scheduler.switch(&mut self.processes, &mut registers);
        self.activate(switch.to);
        log::info!("entering {} at {}", switch.to, registers.instruction_pointer());
        self.resume(&registers)
    }

    /// Handles the trap whose frame the entry stub left at `frame_address`,
    /// and returns the address of the frame to resume.
    pub fn handle_trap(&mut self, frame_address: VirtualAddress) -> VirtualAddress {
        self.processes.reclaim_stacks(&mut self.memory);

        let frame = match self.read_trap_frame(frame_address) {
            Ok(frame) => frame,
            Err(fault) => panic!("trap frame at {frame_address} is unreadable: {fault:?}"),
        };
        let vector = InterruptVector::new(frame.vector as u8);
        let kind = InterruptKind::classify(vector, frame.error_code, arch::read_cr2);

        if let InterruptKind::Hardware { irq } = kind {
            if self.pic.is_spurious(irq) {
                log::debug!("spurious IRQ {irq}");
                self.pic.end_of_spurious(irq);
                return frame_address;
            }
            self.pic.end_of_interrupt(irq);
        }

        let registers = RegisterSnapshot::capture(&frame, frame_address);
        let mut context = InterruptContext::new(vector, frame.error_code, kind, registers);
        match self.handlers.get(vector) {
            Some(handler) => handler(self, &mut context),
            None => self.default_policy(&mut context),
        }
        self.resume(&context.registers)
    }

    /// Saves `context` into the running process and switches to the next one.
    pub fn reschedule(&mut self, context: &mut InterruptContext) {
        let switch = self.scheduler.switch(&mut self.processes, &mut context.registers);
        if !switch.is_same() {
            self.activate(switch.to);
        }
    }

    /// Forks the running process as it was when `context` was captured.
    pub fn fork_current(&mut self, context: &InterruptContext) -> Result<ProcessId, ProcessError> {
        let caller = self.scheduler.current().ok_or(ProcessError::NoSuchProcess)?;
        let parent = self.processes.get_mut(caller).ok_or(ProcessError::NoSuchProcess)?;
        *parent.registers_mut() = context.registers;
        let child = self.processes.fork(&mut self.memory, caller)?;
        self.scheduler.enqueue(child);
        Ok(child)
    }

    /// Replaces the running program with the one registered under the path
    /// found in user memory at `path`. On success `context` resumes the new
    /// program from its entry point.
    pub fn exec_current(
        &mut self,
        context: &mut InterruptContext,
        path: VirtualAddress,
        len: u32,
    ) -> Result<(), ProcessError> {
        let caller = self.scheduler.current().ok_or(ProcessError::NoSuchProcess)?;
        if len > syscall::MAX_PATH {
            return Err(ProcessError::BadAddress);
        }
        let mut buf = [0u8; syscall::MAX_PATH as usize];
        let bytes = &mut buf[..len as usize];
        self.processes
            .get(caller)
            .ok_or(ProcessError::NoSuchProcess)?
            .copy_from_user(&mut self.memory, path, bytes)?;
        let path = core::str::from_utf8(bytes).map_err(|_| ProcessError::BadAddress)?;

        let image = self.programs.get(path).ok_or(ProcessError::ImageNotFound)?;
        self.processes.exec(&mut self.memory, caller, image)?;
        if let Some(process) = self.processes.get(caller) {
            context.registers = *process.registers();
        }
        Ok(())
    }

    /// Terminates the running process and switches to the next one.
    ///
    /// # Panics
    /// Panics if the running process is the idle process.
    pub fn exit_current(&mut self, context: &mut InterruptContext) {
        let Some(caller) = self.scheduler.current() else {
            return;
        };
        if self.scheduler.is_idle(caller) {
            panic!("the idle process cannot exit");
        }
        if let Err(err) = self.terminate(caller) {
            log::error!("{caller}: {err}");
        }
        log::info!("{caller}: exited at {} ms", self.timer.uptime_ms());
        self.reschedule(context);
    }

    /// Removes `id` from the ready queue and the process table and frees
    /// what it owns.
    ///
    /// The running process keeps its kernel stack until the next trap, since
    /// execution is still on it; the caller must reschedule before the trap
    /// returns.
    pub fn terminate(&mut self, id: ProcessId) -> Result<(), ProcessError> {
        if !self.processes.contains(id) {
            return Err(ProcessError::NoSuchProcess);
        }
        let running = self.scheduler.current() == Some(id);
        self.scheduler.remove(id);
        self.processes.terminate(&mut self.memory, id, running)
    }

    /// Copies user memory of `id` into `buf`.
    pub fn copy_from_user(
        &mut self,
        id: ProcessId,
        address: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), ProcessError> {
        self.processes
            .get(id)
            .ok_or(ProcessError::NoSuchProcess)?
            .copy_from_user(&mut self.memory, address, buf)
    }

    /// Copies `bytes` into the user memory of `id`.
    pub fn copy_to_user(
        &mut self,
        id: ProcessId,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), ProcessError> {
        self.processes
            .get(id)
            .ok_or(ProcessError::NoSuchProcess)?
            .copy_to_user(&mut self.memory, address, bytes)
    }

    fn default_policy(&mut self, context: &mut InterruptContext) {
        match *context.kind() {
            InterruptKind::Exception | InterruptKind::PageFault { .. } => self.handle_fault(context),
            InterruptKind::Hardware { irq } => log::debug!("unhandled IRQ {irq}"),
            InterruptKind::Software => {
                log::warn!(
                    "unhandled software interrupt {} at {}",
                    context.vector(),
                    context.instruction_pointer()
                );
            }
        }
    }

    /// Terminates a faulting user process. Faults anywhere else are fatal.
    fn handle_fault(&mut self, context: &mut InterruptContext) {
        let vector = context.vector();
        let culprit = self
            .scheduler
            .current()
            .filter(|&id| context.registers.is_user() && !self.scheduler.is_idle(id));
        let Some(id) = culprit else {
            match *context.kind() {
                InterruptKind::PageFault {
                    faulting_address,
                    error,
                } => panic!(
                    "{vector} in ring 0 at {} accessing {faulting_address} ({error:?})",
                    context.instruction_pointer()
                ),
                _ => panic!(
                    "{vector} in ring 0 at {} (error code {:#x})",
                    context.instruction_pointer(),
                    context.error_code()
                ),
            }
        };

        match *context.kind() {
            InterruptKind::PageFault {
                faulting_address,
                error,
            } => log::warn!(
                "{id}: page fault at {} accessing {faulting_address} ({error:?}); terminating",
                context.instruction_pointer()
            ),
            _ => log::warn!(
                "{id}: {vector} at {} (error code {:#x}); terminating",
                context.instruction_pointer(),
                context.error_code()
            ),
        }
        self.exit_current(context);
    }

    /// Loads the address space and ring-0 stack of `id`.
    fn activate(&mut self, id: ProcessId) {
        let Some(process) = self.processes.get(id) else {
            return;
        };
        match process.address_space() {
            // SAFETY: Every address space shares the kernel half we run in.
            Some(space) if !space.is_active() => unsafe { space.switch_to() },
            // SAFETY: As above.
            None if !self.memory.directory.is_active() => unsafe { self.memory.directory.switch_to() },
            _ => {}
        }
        self.segments.set_kernel_stack(process.kernel_stack().top());
    }

    /// Writes the frame that resumes `registers` and returns its address.
    fn resume(&mut self, registers: &RegisterSnapshot) -> VirtualAddress {
        let stack_top = self
            .scheduler
            .current()
            .and_then(|id| self.processes.get(id))
            .map(|process| process.kernel_stack().top());
        let Some(plan) = ResumePlan::new(registers, stack_top) else {
            panic!(
                "cannot resume ring 3 at {} without a kernel stack",
                registers.instruction_pointer()
            );
        };
        if let Err(fault) = self.write_trap_frame(plan.address, &plan.frame) {
            panic!("resume frame at {} is not mapped: {fault:?}", plan.address);
        }
        plan.address
    }

    /// Reads the trap frame at `address`, including the ring-3 words when the
    /// saved CS says they were pushed.
    pub fn read_trap_frame(&mut self, address: VirtualAddress) -> Result<TrapFrame, PageFault> {
        let mut bytes = [0u8; TrapFrame::USER_SIZE as usize];
        let short = TrapFrame::KERNEL_SIZE as usize;
        self.memory.read(address, &mut bytes[..short])?;
        if TrapFrame::from_bytes(&bytes).is_user() {
            self.memory
                .read(address + TrapFrame::KERNEL_SIZE, &mut bytes[short..])?;
        }
        Ok(TrapFrame::from_bytes(&bytes))
    }

    pub fn write_trap_frame(
        &mut self,
        address: VirtualAddress,
        frame: &TrapFrame,
    ) -> Result<(), PageFault> {
        let (bytes, len) = frame.to_bytes();
        self.memory.write(address, &bytes[..len])
    }
}

fn timer_interrupt<M: PhysicalMemory>(kernel: &mut Kernel<M>, context: &mut InterruptContext) {
    kernel.timer.tick();
    if kernel.scheduler.current().is_some() {
        kernel.reschedule(context);
    }
}
