//! Round-robin scheduling.
//!
//! The scheduler only decides who runs next and moves register snapshots in
//! and out of process control blocks. Loading CR3 and the TSS for the chosen
//! process is left to the kernel, which owns the hardware state.

use alloc::collections::VecDeque;

use crate::{
    interrupts::RegisterSnapshot,
    process::{ProcessId, ProcessState, ProcessTable},
};

/// The outcome of one context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// The process that stopped running, if it still exists.
    pub from: Option<ProcessId>,
    pub to: ProcessId,
}

impl Switch {
    pub fn is_same(&self) -> bool {
        self.from == Some(self.to)
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<ProcessId>,
    current: Option<ProcessId>,
    idle: Option<ProcessId>,
    switches: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            current: None,
            idle: None,
            switches: 0,
        }
    }

    /// Sets the process that runs when nothing else is ready.
    ///
    /// The idle process is never queued.
    pub fn set_idle(&mut self, id: ProcessId) {
        self.ready.retain(|&queued| queued != id);
        self.idle = Some(id);
    }

    pub fn idle(&self) -> Option<ProcessId> {
        self.idle
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    pub fn is_idle(&self, id: ProcessId) -> bool {
        self.idle == Some(id)
    }

    /// Appends `id` to the tail of the ready queue.
    pub fn enqueue(&mut self, id: ProcessId) {
        debug_assert_ne!(self.current, Some(id), "{id} is running and cannot be queued");
        debug_assert!(!self.ready.contains(&id), "{id} is already queued");
        if self.is_idle(id) {
            return;
        }
        self.ready.push_back(id);
    }

    /// Forgets `id` wherever it is: queued, running or idle.
    pub fn remove(&mut self, id: ProcessId) {
        self.ready.retain(|&queued| queued != id);
        if self.current == Some(id) {
            self.current = None;
        }
        if self.idle == Some(id) {
            self.idle = None;
        }
    }

    /// The queued processes, head first.
    pub fn ready(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.ready.iter().copied()
    }

    /// Returns the number of switches performed so far.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Switches to the next ready process.
    ///
    /// `registers` holds the interrupted state on entry. It is saved into the
    /// running process, which goes to the tail of the queue, and replaced with
    /// the saved state of the queue head. The idle process runs when the queue
    /// is empty.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty and there is no idle process.
    pub fn switch(&mut self, processes: &mut ProcessTable, registers: &mut RegisterSnapshot) -> Switch {
        let from = self.current.take();
        if let Some(id) = from {
            if let Some(process) = processes.get_mut(id) {
                *process.registers_mut() = *registers;
                process.set_state(ProcessState::Ready);
                if !self.is_idle(id) {
                    self.ready.push_back(id);
                }
            }
        }

        let to = loop {
            match self.ready.pop_front() {
                Some(id) if processes.contains(id) => break id,
                Some(stale) => log::warn!("dropping {stale} from the ready queue; it no longer exists"),
                None => match self.idle {
                    Some(idle) => break idle,
                    None => panic!("ready queue is empty and there is no idle process"),
                },
            }
        };

        let Some(process) = processes.get_mut(to) else {
            panic!("idle process {to} is not in the process table");
        };
        process.set_state(ProcessState::Running);
        *registers = *process.registers();
        self.current = Some(to);
        self.switches += 1;

        let switch = Switch {
            from: from.filter(|&id| processes.contains(id)),
            to,
        };
        log::trace!("switch {:?} -> {}", switch.from, to);
        switch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::KernelConfig, mem::KernelMemory, process::tests::memory};
    use pmm::{EmulatedMemory, VirtualAddress};

    struct Fixture {
        memory: KernelMemory<EmulatedMemory>,
        processes: ProcessTable,
        scheduler: Scheduler,
    }

    fn fixture(count: u32) -> (Fixture, alloc::vec::Vec<ProcessId>) {
        let mut memory = memory(128);
        let mut processes = ProcessTable::new(&mut memory, &KernelConfig::DEFAULT).expect("table");
        let mut scheduler = Scheduler::new();
        let ids = (0..count)
            .map(|i| {
                let entry = VirtualAddress::new(0xC010_0000 + i * 0x100);
                let id = processes.create_kernel(&mut memory, entry).expect("process");
                scheduler.enqueue(id);
                id
            })
            .collect();
        (
            Fixture {
                memory,
                processes,
                scheduler,
            },
            ids,
        )
    }

    impl Fixture {
        fn switch(&mut self, registers: &mut RegisterSnapshot) -> Switch {
            self.scheduler.switch(&mut self.processes, registers)
        }
    }

    #[test]
    fn first_switch_runs_the_head() {
        let (mut f, ids) = fixture(2);
        let mut registers = RegisterSnapshot::default();
        let switch = f.switch(&mut registers);

        assert_eq!(switch, Switch { from: None, to: ids[0] });
        assert_eq!(f.scheduler.current(), Some(ids[0]));
        assert_eq!(&registers, f.processes.get(ids[0]).expect("p").registers());
        assert_eq!(f.processes.get(ids[0]).expect("p").state(), ProcessState::Running);
        assert_eq!(f.scheduler.ready().collect::<Vec<_>>(), [ids[1]]);
    }

    #[test]
    fn running_process_is_never_queued() {
        let (mut f, _) = fixture(3);
        let mut registers = RegisterSnapshot::default();
        for _ in 0..10 {
            f.switch(&mut registers);
            let current = f.scheduler.current().expect("current");
            assert!(f.scheduler.ready().all(|id| id != current));
            assert_eq!(f.scheduler.ready().count(), 2);
        }
    }

    #[test]
    fn every_process_runs_once_per_window() {
        let (mut f, ids) = fixture(3);
        let mut registers = RegisterSnapshot::default();
        let trace: Vec<ProcessId> = (0..12).map(|_| f.switch(&mut registers).to).collect();

        for window in trace.windows(ids.len()) {
            let mut seen = window.to_vec();
            seen.sort();
            assert_eq!(seen, ids);
        }
        assert_eq!(&trace[..4], &[ids[0], ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn snapshots_survive_a_round_trip() {
        let (mut f, ids) = fixture(2);
        let mut registers = RegisterSnapshot::default();
        f.switch(&mut registers);

        registers.eax = 0x1111;
        registers.esi = 0x2222;
        registers.eip = 0xC010_0042;
        registers.esp -= 0x40;
        let stopped = registers;

        assert_eq!(f.switch(&mut registers).to, ids[1]);
        registers.eax = 0xDEAD;
        registers.ebx = 0xBEEF;

        assert_eq!(f.switch(&mut registers).to, ids[0]);
        assert_eq!(registers, stopped);
    }

    #[test]
    fn idle_runs_only_when_nothing_is_ready() {
        let (mut f, ids) = fixture(1);
        let idle = f
            .processes
            .create_kernel(&mut f.memory, VirtualAddress::new(0xC020_0000))
            .expect("idle");
        f.scheduler.set_idle(idle);

        let mut registers = RegisterSnapshot::default();
        assert_eq!(f.switch(&mut registers).to, ids[0]);
        assert_eq!(f.switch(&mut registers).to, ids[0]);

        f.processes.terminate(&mut f.memory, ids[0], true).expect("terminate");
        f.scheduler.remove(ids[0]);
        let switch = f.switch(&mut registers);
        assert_eq!(switch, Switch { from: None, to: idle });
        assert!(f.scheduler.ready().next().is_none());

        let next = f
            .processes
            .create_kernel(&mut f.memory, VirtualAddress::new(0xC030_0000))
            .expect("next");
        f.scheduler.enqueue(next);
        assert_eq!(f.switch(&mut registers), Switch { from: Some(idle), to: next });
        assert!(f.scheduler.ready().next().is_none());
    }

    #[test]
    fn stale_entries_are_skipped() {
        let (mut f, ids) = fixture(2);
        f.processes.terminate(&mut f.memory, ids[0], false).expect("terminate");
        let mut registers = RegisterSnapshot::default();
        assert_eq!(f.switch(&mut registers).to, ids[1]);
    }

    #[test]
    #[should_panic(expected = "ready queue is empty and there is no idle process")]
    fn starvation_is_fatal() {
        let (mut f, _) = fixture(0);
        f.switch(&mut RegisterSnapshot::default());
    }
}
