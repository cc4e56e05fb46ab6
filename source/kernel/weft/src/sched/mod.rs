// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler over the process table
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/schedule/tick/current), Decision
//! DEPENDS_ON: task::ProcessTable
//! INVARIANTS: Scan starts at current + 1 and wraps once; with K runnable processes each is
//!             picked within K consecutive decisions; no priorities

use crate::task::{ProcState, ProcessTable};
use crate::types::Pid;

/// Outcome of one scheduling decision.
#[must_use = "a decision must be acted upon"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run(Pid),
    /// Full cycle without a runnable process.
    Idle,
}

/// Scheduler state: the current slot plus counters.
pub struct Scheduler {
    current: Pid,
    ticks: u64,
    switches: u64,
    idle_polls: u64,
    hz: u32,
}

impl Scheduler {
    pub const fn new(hz: u32) -> Self {
        Self { current: Pid::RESERVED, ticks: 0, switches: 0, idle_polls: 0, hz }
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn set_current(&mut self, pid: Pid) {
        if pid != self.current {
            self.switches += 1;
        }
        self.current = pid;
    }

    /// Counts one timer interrupt.
    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Milliseconds of timer time observed so far.
    pub fn uptime_ms(&self) -> u64 {
        self.ticks * 1000 / u64::from(self.hz.max(1))
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    pub fn idle_polls(&self) -> u64 {
        self.idle_polls
    }

    /// Picks the first Runnable slot after the current one, wrapping around once.
    pub fn schedule(&mut self, processes: &ProcessTable) -> Decision {
        let n = processes.len();
        if n == 0 {
            return Decision::Idle;
        }
        let start = self.current.as_index();
        for step in 1..=n {
            let pid = Pid::from((start + step) % n);
            if processes.state(pid) == ProcState::Runnable {
                self.set_current(pid);
                return Decision::Run(pid);
            }
        }
        self.idle_polls += 1;
        log_trace!(target: "sched", "idle: no runnable process");
        Decision::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryLayout;
    use crate::mm::AddressSpaceManager;
    use crate::task::{ImageLoader, ProgramImage};

    fn table_with(runnable: &[u32]) -> ProcessTable {
        let mut mm = AddressSpaceManager::new(MemoryLayout::new()).expect("mm");
        let mut loader = ImageLoader::new().with_program(ProgramImage::new(0x10_0000).segment(0x10_0000, &[1], 0x1000, false));
        let mut table = ProcessTable::new(8);
        for pid in runnable {
            table.setup(&mut mm, Pid::from_raw(*pid), 0, &mut loader).expect("setup");
        }
        table
    }

    #[test]
    fn scans_from_next_slot_and_wraps() {
        let table = table_with(&[2, 5]);
        let mut sched = Scheduler::new(100);
        sched.set_current(Pid::from_raw(5));
        assert_eq!(sched.schedule(&table), Decision::Run(Pid::from_raw(2)));
        assert_eq!(sched.schedule(&table), Decision::Run(Pid::from_raw(5)));
        assert_eq!(sched.schedule(&table), Decision::Run(Pid::from_raw(2)));
    }

    #[test]
    fn single_runnable_process_is_rescheduled() {
        let table = table_with(&[3]);
        let mut sched = Scheduler::new(100);
        sched.set_current(Pid::from_raw(3));
        assert_eq!(sched.schedule(&table), Decision::Run(Pid::from_raw(3)));
    }

    #[test]
    fn every_runnable_process_runs_within_k_decisions() {
        let runnable = [1u32, 2, 4, 7];
        let table = table_with(&runnable);
        let mut sched = Scheduler::new(100);
        sched.set_current(Pid::from_raw(1));
        let mut seen = [false; 8];
        for _ in 0..runnable.len() {
            if let Decision::Run(pid) = sched.schedule(&table) {
                seen[pid.as_index()] = true;
            }
        }
        for pid in runnable {
            assert!(seen[pid as usize], "pid {} never scheduled", pid);
        }
    }

    #[test]
    fn idle_when_nothing_runnable() {
        let table = table_with(&[]);
        let mut sched = Scheduler::new(100);
        assert_eq!(sched.schedule(&table), Decision::Idle);
        assert_eq!(sched.idle_polls(), 1);
    }

    #[test]
    fn ticks_convert_to_uptime() {
        let mut sched = Scheduler::new(100);
        for _ in 0..250 {
            sched.tick();
        }
        assert_eq!(sched.ticks(), 250);
        assert_eq!(sched.uptime_ms(), 2500);
    }
}
