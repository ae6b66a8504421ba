//! The process control block store.
//!
//! A [`ProcessTable`] owns every live [`Process`]: its saved registers, its
//! kernel stack and, for user processes, its [`AddressSpace`]. Scheduling
//! order lives in the scheduler; the table only knows who exists.

use alloc::collections::BTreeMap;
use core::fmt;

use pmm::{AddressSpace, AllocError, PAGE_SIZE, PageFlags, PhysicalMemory, VirtualAddress};
use x86_64::PrivilegeLevel;

use crate::{config::KernelConfig, interrupts::RegisterSnapshot, mem::KernelMemory, modules::ProgramImage};

mod stack;

pub use stack::{KernelStack, KernelStackArea, STACK_AREA_BASE};

/// Where program images are loaded and entered.
pub const USER_IMAGE_BASE: VirtualAddress = VirtualAddress::new(0x0040_0000);

/// Initial user ESP. The page below the kernel boundary stays unmapped.
pub const USER_STACK_TOP: VirtualAddress = VirtualAddress::new(0xBFFF_F000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    OutOfMemory,
    NoSuchProcess,
    ImageNotFound,
    /// The image has no bytes, so there is nothing to enter.
    EmptyImage,
    ImageTooLarge,
    TableFull,
    /// The operation needs a user address space.
    KernelProcess,
    /// A user pointer did not refer to readable user memory.
    BadAddress,
}

impl From<AllocError> for ProcessError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory => ProcessError::OutOfMemory,
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ProcessError::OutOfMemory => "out of physical memory",
            ProcessError::NoSuchProcess => "no such process",
            ProcessError::ImageNotFound => "program image not found",
            ProcessError::EmptyImage => "program image is empty",
            ProcessError::ImageTooLarge => "program image exceeds its memory budget",
            ProcessError::TableFull => "process table is full",
            ProcessError::KernelProcess => "operation needs a user process",
            ProcessError::BadAddress => "bad user address",
        };
        f.write_str(message)
    }
}

/// One process control block.
#[derive(Debug)]
pub struct Process {
    id: ProcessId,
    state: ProcessState,
    registers: RegisterSnapshot,
    kernel_stack: KernelStack,
    address_space: Option<AddressSpace>,
    parent: Option<ProcessId>,
}

impl Process {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    /// The registers saved when the process last stopped running.
    pub fn registers(&self) -> &RegisterSnapshot {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterSnapshot {
        &mut self.registers
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    /// Returns `None` for processes that only ever run in ring 0.
    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    pub fn is_kernel(&self) -> bool {
        self.address_space.is_none()
    }

    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    /// Copies user memory at `address` into `buf` with ring-3 permissions.
    pub fn copy_from_user<M: PhysicalMemory>(
        &self,
        memory: &mut KernelMemory<M>,
        address: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), ProcessError> {
        let space = self.address_space.as_ref().ok_or(ProcessError::KernelProcess)?;
        space
            .copy_from(&mut memory.physical, address, buf, PrivilegeLevel::Ring3)
            .map_err(|fault| {
                log::debug!("{}: user copy faulted at {}", self.id, fault.address);
                ProcessError::BadAddress
            })
    }

    /// Copies `bytes` into user memory at `address` with ring-3 permissions.
    pub fn copy_to_user<M: PhysicalMemory>(
        &self,
        memory: &mut KernelMemory<M>,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), ProcessError> {
        let space = self.address_space.as_ref().ok_or(ProcessError::KernelProcess)?;
        space
            .copy_to(&mut memory.physical, address, bytes, PrivilegeLevel::Ring3)
            .map_err(|_| ProcessError::BadAddress)
    }
}

/// Every live process, keyed by id.
pub struct ProcessTable {
    processes: BTreeMap<ProcessId, Process>,
    next_id: u32,
    stacks: KernelStackArea,
    max_processes: usize,
    user_stack_pages: usize,
    image_budget_pages: usize,
}

impl ProcessTable {
    pub fn new<M: PhysicalMemory>(
        memory: &mut KernelMemory<M>,
        config: &KernelConfig,
    ) -> Result<Self, ProcessError> {
        let stacks =
            KernelStackArea::new(memory, config.kernel_stack_pages, config.max_processes)?;
        Ok(Self {
            processes: BTreeMap::new(),
            next_id: 1,
            stacks,
            max_processes: config.max_processes,
            user_stack_pages: config.user_stack_pages,
            image_budget_pages: config.image_budget_pages,
        })
    }

    pub fn get(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&id)
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.processes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.processes.keys().copied()
    }

    pub fn stacks(&self) -> &KernelStackArea {
        &self.stacks
    }

    /// Frees the kernel stacks of processes that terminated while running.
    pub fn reclaim_stacks<M: PhysicalMemory>(&mut self, memory: &mut KernelMemory<M>) -> usize {
        self.stacks.drain_retired(memory)
    }

    fn insert(
        &mut self,
        kernel_stack: KernelStack,
        registers: RegisterSnapshot,
        address_space: Option<AddressSpace>,
        parent: Option<ProcessId>,
    ) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        self.processes.insert(
            id,
            Process {
                id,
                state: ProcessState::Ready,
                registers,
                kernel_stack,
                address_space,
                parent,
            },
        );
        id
    }

    fn check_capacity(&self) -> Result<(), ProcessError> {
        if self.processes.len() >= self.max_processes {
            return Err(ProcessError::TableFull);
        }
        Ok(())
    }

    /// Creates a ring-0 process that starts at `entry` on its own kernel stack.
    pub fn create_kernel<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
        entry: VirtualAddress,
    ) -> Result<ProcessId, ProcessError> {
        self.check_capacity()?;
        let stack = self.stacks.allocate(memory)?;
        let registers = RegisterSnapshot::kernel(entry, stack.top());
        let id = self.insert(stack, registers, None, None);
        log::debug!("{id}: kernel process at {entry}");
        Ok(id)
    }

    /// Creates a user process running `entry` in `address_space`.
    ///
    /// A fresh user stack is mapped below [`USER_STACK_TOP`]. The address space
    /// is destroyed if creation fails.
    pub fn create<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
        entry: VirtualAddress,
        mut address_space: AddressSpace,
    ) -> Result<ProcessId, ProcessError> {
        let stack = match self.prepare_user(memory, &mut address_space) {
            Ok(stack) => stack,
            Err(err) => {
                address_space.destroy(&mut memory.physical, &mut memory.frames);
                return Err(err);
            }
        };
        let registers = RegisterSnapshot::user(entry, USER_STACK_TOP);
        let id = self.insert(stack, registers, Some(address_space), None);
        log::debug!("{id}: user process at {entry}");
        Ok(id)
    }

    fn prepare_user<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
        address_space: &mut AddressSpace,
    ) -> Result<KernelStack, ProcessError> {
        self.check_capacity()?;
        self.map_user_stack(memory, address_space)?;
        self.stacks.allocate(memory)
    }

    /// Creates a user process running `image`.
    pub fn spawn<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
        image: &ProgramImage,
    ) -> Result<ProcessId, ProcessError> {
        self.check_capacity()?;
        let space = self.load_image(memory, image)?;
        let id = self.create(memory, USER_IMAGE_BASE, space)?;
        log::info!("{id}: started {}", image.name());
        Ok(id)
    }

    /// Creates a copy of `parent` with its own address space.
    ///
    /// The child resumes with the parent's registers except `eax`, which is 0.
    pub fn fork<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
        parent: ProcessId,
    ) -> Result<ProcessId, ProcessError> {
        let source = self.processes.get(&parent).ok_or(ProcessError::NoSuchProcess)?;
        let space = source.address_space.as_ref().ok_or(ProcessError::KernelProcess)?;
        let mut registers = source.registers;
        registers.eax = 0;
        self.check_capacity()?;

        let copy = space.duplicate(&mut memory.physical, &mut memory.frames)?;
        let stack = match self.stacks.allocate(memory) {
            Ok(stack) => stack,
            Err(err) => {
                copy.destroy(&mut memory.physical, &mut memory.frames);
                return Err(err);
            }
        };
        let id = self.insert(stack, registers, Some(copy), Some(parent));
        log::debug!("{id}: forked from {parent}");
        Ok(id)
    }

    /// Replaces the program running in `id` with `image`.
    ///
    /// The new image is built in a fresh address space; the old one is only
    /// destroyed once that succeeds, so a failed exec changes nothing.
    pub fn exec<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
        id: ProcessId,
        image: &ProgramImage,
    ) -> Result<(), ProcessError> {
        if !self.processes.contains_key(&id) {
            return Err(ProcessError::NoSuchProcess);
        }
        let mut space = self.load_image(memory, image)?;
        if let Err(err) = self.map_user_stack(memory, &mut space) {
            space.destroy(&mut memory.physical, &mut memory.frames);
            return Err(err);
        }

        let process = self.processes.get_mut(&id).ok_or(ProcessError::NoSuchProcess)?;
        let old = process.address_space.replace(space);
        process.registers = RegisterSnapshot::user(USER_IMAGE_BASE, USER_STACK_TOP);
        if let Some(old) = old {
            if old.is_active() {
                if let Some(new) = &process.address_space {
                    // SAFETY: Both spaces share the kernel half we are running in.
                    unsafe { new.switch_to() };
                }
            }
            old.destroy(&mut memory.physical, &mut memory.frames);
        }
        log::info!("{id}: exec {}", image.name());
        Ok(())
    }

    /// Removes `id` and returns everything it owns to the frame allocator.
    ///
    /// When `stack_in_use` is set the process's kernel stack is retired instead
    /// of freed, and comes back at the next [`ProcessTable::reclaim_stacks`].
    pub fn terminate<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
        id: ProcessId,
        stack_in_use: bool,
    ) -> Result<(), ProcessError> {
        let Process {
            kernel_stack,
            address_space,
            ..
        } = self.processes.remove(&id).ok_or(ProcessError::NoSuchProcess)?;

        if let Some(space) = address_space {
            if space.is_active() {
                // SAFETY: The kernel directory maps everything the kernel uses.
                unsafe { memory.directory.switch_to() };
            }
            space.destroy(&mut memory.physical, &mut memory.frames);
        }

        if stack_in_use {
            self.stacks.retire(kernel_stack);
        } else {
            self.stacks.free(memory, kernel_stack);
        }
        log::debug!("{id}: terminated");
        Ok(())
    }

    fn load_image<M: PhysicalMemory>(
        &self,
        memory: &mut KernelMemory<M>,
        image: &ProgramImage,
    ) -> Result<AddressSpace, ProcessError> {
        if image.size() == 0 {
            log::warn!("{} is empty", image.name());
            return Err(ProcessError::EmptyImage);
        }
        if image.pages() > self.image_budget_pages {
            log::warn!(
                "{} needs {} pages; the budget is {}",
                image.name(),
                image.pages(),
                self.image_budget_pages
            );
            return Err(ProcessError::ImageTooLarge);
        }

        let mut space = AddressSpace::new(&memory.directory, &mut memory.physical, &mut memory.frames)?;
        if let Err(err) = Self::copy_image(memory, &mut space, image) {
            space.destroy(&mut memory.physical, &mut memory.frames);
            return Err(err);
        }
        Ok(space)
    }

    fn copy_image<M: PhysicalMemory>(
        memory: &mut KernelMemory<M>,
        space: &mut AddressSpace,
        image: &ProgramImage,
    ) -> Result<(), ProcessError> {
        space.map_range_fresh(
            &mut memory.physical,
            &mut memory.frames,
            USER_IMAGE_BASE,
            image.pages(),
            PageFlags::user_data(),
        )?;

        let mut chunk = [0u8; 512];
        let mut offset = 0;
        while offset < image.size() {
            let count = (image.size() - offset).min(chunk.len() as u32);
            let bytes = &mut chunk[..count as usize];
            memory.physical.read(image.start() + offset, bytes);
            space
                .copy_to(&mut memory.physical, USER_IMAGE_BASE + offset, bytes, PrivilegeLevel::Ring0)
                .map_err(|_| ProcessError::BadAddress)?;
            offset += count;
        }
        Ok(())
    }

    fn map_user_stack<M: PhysicalMemory>(
        &self,
        memory: &mut KernelMemory<M>,
        space: &mut AddressSpace,
    ) -> Result<(), ProcessError> {
        let bottom = USER_STACK_TOP - (self.user_stack_pages * PAGE_SIZE) as u32;
        space.map_range_fresh(
            &mut memory.physical,
            &mut memory.frames,
            bottom,
            self.user_stack_pages,
            PageFlags::user_data(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pmm::{EmulatedMemory, FrameAllocator, PageDirectory, PhysicalAddress};

    pub(crate) fn memory(frames: usize) -> KernelMemory<EmulatedMemory> {
        let mut physical = EmulatedMemory::new(frames);
        let mut allocator = FrameAllocator::new(&physical.memory_map());
        let directory = PageDirectory::new(&mut physical, &mut allocator).expect("directory");
        KernelMemory::new(physical, allocator, directory)
    }

    /// Places `bytes` in frames taken from the allocator, like a boot module.
    pub(crate) fn image(
        memory: &mut KernelMemory<EmulatedMemory>,
        name: &str,
        bytes: &[u8],
    ) -> ProgramImage {
        let pages = bytes.len().div_ceil(PAGE_SIZE).max(1);
        let first = memory.frames.allocate_frame().expect("image frame");
        for i in 1..pages {
            let next = memory.frames.allocate_frame().expect("image frame");
            assert_eq!(next.start_address(), first.start_address() + (i * PAGE_SIZE) as u32);
        }
        memory.physical.write(first.start_address(), bytes);
        ProgramImage::new(name, first.start_address(), bytes.len() as u32)
    }

    fn table(memory: &mut KernelMemory<EmulatedMemory>) -> ProcessTable {
        ProcessTable::new(memory, &KernelConfig::DEFAULT).expect("table")
    }

    fn user_byte(memory: &mut KernelMemory<EmulatedMemory>, process: &Process, at: VirtualAddress) -> u8 {
        let mut byte = [0u8];
        process.copy_from_user(memory, at, &mut byte).expect("user read");
        byte[0]
    }

    #[test]
    fn spawned_process_sees_its_image_and_stack() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let program = image(&mut memory, "/bin/init", b"\xEB\xFE hello");

        let id = table.spawn(&mut memory, &program).expect("spawn");
        let process = table.get(id).expect("process");
        assert_eq!(process.state(), ProcessState::Ready);
        assert_eq!(*process.registers(), RegisterSnapshot::user(USER_IMAGE_BASE, USER_STACK_TOP));
        assert!(!process.is_kernel());

        let mut text = [0u8; 5];
        process
            .copy_from_user(&mut memory, USER_IMAGE_BASE + 3, &mut text)
            .expect("image");
        assert_eq!(&text, b"hello");
        assert_eq!(user_byte(&mut memory, process, USER_STACK_TOP - 1), 0);

        // Kernel memory and the guard page above the stack are off limits.
        let mut byte = [0u8];
        assert_eq!(
            process.copy_from_user(&mut memory, process.kernel_stack().bottom(), &mut byte),
            Err(ProcessError::BadAddress)
        );
        assert_eq!(
            process.copy_from_user(&mut memory, USER_STACK_TOP, &mut byte),
            Err(ProcessError::BadAddress)
        );
    }

    #[test]
    fn kernel_processes_run_on_their_kernel_stack() {
        let mut memory = memory(64);
        let mut table = table(&mut memory);
        let entry = VirtualAddress::new(0xC010_0000);

        let id = table.create_kernel(&mut memory, entry).expect("idle");
        let process = table.get(id).expect("process");
        assert!(process.is_kernel());
        assert_eq!(process.registers().privilege(), PrivilegeLevel::Ring0);
        assert_eq!(process.registers().stack_pointer(), process.kernel_stack().top());
        assert_eq!(table.fork(&mut memory, id), Err(ProcessError::KernelProcess));
    }

    #[test]
    fn ids_are_unique() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let entry = VirtualAddress::new(0xC010_0000);

        let a = table.create_kernel(&mut memory, entry).expect("a");
        table.terminate(&mut memory, a, false).expect("terminate");
        let b = table.create_kernel(&mut memory, entry).expect("b");
        assert_ne!(a, b);
        assert!(!table.contains(a));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn terminate_returns_every_frame() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let program = image(&mut memory, "prog", &[0x90; 5000]);
        let before = memory.frames.free_frames();

        let id = table.spawn(&mut memory, &program).expect("spawn");
        assert!(memory.frames.free_frames() < before);
        table.terminate(&mut memory, id, false).expect("terminate");
        assert_eq!(memory.frames.free_frames(), before);
        assert_eq!(table.terminate(&mut memory, id, false), Err(ProcessError::NoSuchProcess));
    }

    #[test]
    fn running_stack_is_retired_until_reclaimed() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let program = image(&mut memory, "prog", &[1, 2, 3]);
        let before = memory.frames.free_frames();

        let id = table.spawn(&mut memory, &program).expect("spawn");
        table.terminate(&mut memory, id, true).expect("terminate");
        let stack_pages = KernelConfig::DEFAULT.kernel_stack_pages;
        assert_eq!(memory.frames.free_frames(), before - stack_pages);

        assert_eq!(table.reclaim_stacks(&mut memory), 1);
        assert_eq!(memory.frames.free_frames(), before);
    }

    #[test]
    fn terminating_the_active_space_switches_to_the_kernel_directory() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let program = image(&mut memory, "prog", &[1]);

        let id = table.spawn(&mut memory, &program).expect("spawn");
        let space = table.get(id).and_then(Process::address_space).expect("space");
        unsafe { space.switch_to() };
        table.terminate(&mut memory, id, true).expect("terminate");
        assert!(memory.directory.is_active());
    }

    #[test]
    fn fork_copies_memory_and_registers() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let program = image(&mut memory, "prog", b"parent");
        let parent = table.spawn(&mut memory, &program).expect("spawn");
        table.get_mut(parent).expect("parent").registers_mut().eax = 2;
        table.get_mut(parent).expect("parent").registers_mut().ebx = 77;

        let child = table.fork(&mut memory, parent).expect("fork");
        let (p, c) = (table.get(parent).expect("parent"), table.get(child).expect("child"));
        assert_eq!(c.parent(), Some(parent));
        assert_eq!(c.registers().eax, 0);
        assert_eq!(c.registers().ebx, 77);
        assert_eq!(p.registers().eax, 2);
        assert_ne!(c.kernel_stack().top(), p.kernel_stack().top());

        let (ps, cs) = (p.address_space().expect("p"), c.address_space().expect("c"));
        assert_eq!(ps.owned_frames(&mut memory.physical), cs.owned_frames(&mut memory.physical));
        cs.copy_to(&mut memory.physical, USER_IMAGE_BASE, b"child!", PrivilegeLevel::Ring3)
            .expect("child write");

        let mut text = [0u8; 6];
        p.copy_from_user(&mut memory, USER_IMAGE_BASE, &mut text).expect("parent");
        assert_eq!(&text, b"parent");
        c.copy_from_user(&mut memory, USER_IMAGE_BASE, &mut text).expect("child");
        assert_eq!(&text, b"child!");
    }

    #[test]
    fn fork_out_of_memory_leaks_nothing() {
        let mut memory = memory(48);
        let mut table = table(&mut memory);
        let program = image(&mut memory, "prog", &[0xCC; 4096]);
        let parent = table.spawn(&mut memory, &program).expect("spawn");
        let before = memory.frames.free_frames();

        let mut children = Vec::new();
        let err = loop {
            match table.fork(&mut memory, parent) {
                Ok(child) => children.push(child),
                Err(err) => break err,
            }
        };
        assert_eq!(err, ProcessError::OutOfMemory);
        assert!(!children.is_empty());

        for child in children {
            table.terminate(&mut memory, child, false).expect("terminate");
        }
        assert_eq!(memory.frames.free_frames(), before);
    }

    #[test]
    fn exec_replaces_the_image() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let first = image(&mut memory, "first", b"one");
        let second = image(&mut memory, "second", b"two");

        let id = table.spawn(&mut memory, &first).expect("spawn");
        table.get_mut(id).expect("process").registers_mut().eip = 0x0040_0123;
        let before = memory.frames.free_frames();

        table.exec(&mut memory, id, &second).expect("exec");
        let process = table.get(id).expect("process");
        assert_eq!(*process.registers(), RegisterSnapshot::user(USER_IMAGE_BASE, USER_STACK_TOP));
        let mut text = [0u8; 3];
        process.copy_from_user(&mut memory, USER_IMAGE_BASE, &mut text).expect("image");
        assert_eq!(&text, b"two");
        assert_eq!(memory.frames.free_frames(), before);
    }

    #[test]
    fn exec_of_active_space_moves_cr3() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let first = image(&mut memory, "first", b"one");
        let second = image(&mut memory, "second", b"two");

        let id = table.spawn(&mut memory, &first).expect("spawn");
        unsafe { table.get(id).and_then(Process::address_space).expect("space").switch_to() };
        table.exec(&mut memory, id, &second).expect("exec");
        assert!(table.get(id).and_then(Process::address_space).expect("space").is_active());
    }

    #[test]
    fn failed_exec_leaves_the_process_alone() {
        let mut memory = memory(128);
        let mut table = ProcessTable::new(
            &mut memory,
            &KernelConfig {
                image_budget_pages: 1,
                ..KernelConfig::DEFAULT
            },
        )
        .expect("table");
        let small = image(&mut memory, "small", b"ok");
        let id = table.spawn(&mut memory, &small).expect("spawn");
        table.get_mut(id).expect("process").registers_mut().eax = 3;
        let before = memory.frames.free_frames();

        let large = ProgramImage::new("large", PhysicalAddress::new(0), 4097);
        assert_eq!(table.exec(&mut memory, id, &large), Err(ProcessError::ImageTooLarge));
        assert_eq!(table.exec(&mut memory, ProcessId::new(99), &small), Err(ProcessError::NoSuchProcess));
        assert_eq!(table.get(id).expect("process").registers().eax, 3);
        assert_eq!(memory.frames.free_frames(), before);
    }

    #[test]
    fn empty_images_are_rejected() {
        let mut memory = memory(128);
        let mut table = table(&mut memory);
        let program = image(&mut memory, "p", b"\x90");
        let empty = ProgramImage::new("empty", PhysicalAddress::new(0x1000), 0);
        let before = memory.frames.free_frames();

        assert_eq!(table.spawn(&mut memory, &empty), Err(ProcessError::EmptyImage));
        assert!(table.is_empty());
        assert_eq!(memory.frames.free_frames(), before);

        let id = table.spawn(&mut memory, &program).expect("spawn");
        assert_eq!(table.exec(&mut memory, id, &empty), Err(ProcessError::EmptyImage));
        let space = table.get(id).and_then(Process::address_space).expect("space");
        assert!(space.directory().translate(&mut memory.physical, USER_IMAGE_BASE).is_some());
    }

    #[test]
    fn table_capacity_is_enforced() {
        let mut memory = memory(64);
        let mut table = ProcessTable::new(
            &mut memory,
            &KernelConfig {
                max_processes: 2,
                ..KernelConfig::DEFAULT
            },
        )
        .expect("table");
        let entry = VirtualAddress::new(0xC010_0000);
        table.create_kernel(&mut memory, entry).expect("a");
        table.create_kernel(&mut memory, entry).expect("b");
        assert_eq!(table.create_kernel(&mut memory, entry), Err(ProcessError::TableFull));
    }
}
