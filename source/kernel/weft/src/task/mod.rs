// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and process lifecycle (setup, fork, exit, fault)
//! OWNERS: @kernel-team
//! PUBLIC API: ProcessTable::{setup, fork, exit, mark_broken}, Process, ProcState
//! DEPENDS_ON: mm::AddressSpaceManager, trap::Registers, task::loader
//! INVARIANTS: PID equals slot index; slot 0 never leaves Free; a Free slot holds no page
//!             table; failed setup/fork leave the slot Free and memory untouched

extern crate alloc;

use alloc::vec::Vec;

use thiserror::Error;

use crate::mm::verify::ProcessView;
use crate::mm::{AddressSpaceError, AddressSpaceManager, PageFlags, PAGE_SIZE};
use crate::trap::Registers;
use crate::types::{PageNumber, Pid};

pub mod loader;

pub use loader::{ImageLoader, LoadError, LoadTarget, ProgramImage, ProgramLoader, Segment};

/// Lifecycle state of a process slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Free,
    Runnable,
    /// Faulted in user mode; never scheduled again.
    Broken,
}

/// Errors returned by [`ProcessTable::fork`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ForkError {
    #[error("process table is full")]
    TableFull,
    #[error("pid {0} cannot fork")]
    InvalidParent(Pid),
    #[error("address space duplication failed: {0}")]
    AddressSpace(AddressSpaceError),
}

impl From<AddressSpaceError> for ForkError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

/// Errors returned by [`ProcessTable::setup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("pid {0} is not a usable process slot")]
    InvalidPid(Pid),
    #[error("pid {0} is already in use")]
    SlotInUse(Pid),
    #[error("address space: {0}")]
    AddressSpace(AddressSpaceError),
    #[error("program load failed: {0}")]
    Load(LoadError),
}

impl From<AddressSpaceError> for SetupError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<LoadError> for SetupError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

/// Process descriptor.
#[derive(Clone, Debug)]
pub struct Process {
    pid: Pid,
    state: ProcState,
    regs: Registers,
    page_table: Option<PageNumber>,
}

impl Process {
    fn empty(pid: Pid) -> Self {
        Self { pid, state: ProcState::Free, regs: Registers::default(), page_table: None }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ProcState::Runnable
    }

    /// Runnable or Broken: the slot still owns an address space.
    pub fn is_live(&self) -> bool {
        self.state != ProcState::Free
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// Root of the process page table.
    pub fn page_table(&self) -> Option<PageNumber> {
        self.page_table
    }
}

/// Fixed-size table of process descriptors.
pub struct ProcessTable {
    slots: Vec<Process>,
}

impl ProcessTable {
    /// Creates `nproc` Free slots.
    pub fn new(nproc: usize) -> Self {
        Self { slots: (0..nproc).map(|pid| Process::empty(Pid::from(pid))).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_index())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_index())
    }

    pub fn state(&self, pid: Pid) -> ProcState {
        self.get(pid).map_or(ProcState::Free, Process::state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter()
    }

    pub fn runnable_count(&self) -> usize {
        self.slots.iter().filter(|p| p.is_runnable()).count()
    }

    /// Snapshot handed to the invariant checker.
    pub fn views(&self) -> Vec<ProcessView> {
        self.slots
            .iter()
            .map(|p| ProcessView { pid: p.pid, live: p.is_live(), root: p.page_table })
            .collect()
    }

    /// Loads `program` as process `pid` with a private address space and one stack page.
    pub fn setup(
        &mut self,
        mm: &mut AddressSpaceManager,
        pid: Pid,
        program: usize,
        loader: &mut impl ProgramLoader,
    ) -> Result<(), SetupError> {
        if pid == Pid::RESERVED || pid.as_index() >= self.slots.len() {
            return Err(SetupError::InvalidPid(pid));
        }
        let slot = &mut self.slots[pid.as_index()];
        if slot.state != ProcState::Free {
            return Err(SetupError::SlotInUse(pid));
        }
        *slot = Process::empty(pid);

        let root = mm.duplicate(mm.kernel_root(), pid)?;

        let entry = match load_image(mm, root, pid, program, loader) {
            Ok(entry) => entry,
            Err(err) => {
                mm.free(root);
                log_warn!(target: "task", "setup pid {} program {} failed: {}", pid, program, err);
                return Err(err);
            }
        };

        slot.regs = Registers::user(entry as u64, mm.layout().virtual_size as u64);
        slot.page_table = Some(root);
        slot.state = ProcState::Runnable;
        log_info!(target: "task", "setup pid {} program {} entry={:#x}", pid, program, entry);
        Ok(())
    }

    /// Forks `parent` into the first Free slot.
    ///
    /// The child gets a duplicate address space and the parent's registers with `rax = 0`;
    /// the parent's `rax` becomes the child pid.
    pub fn fork(&mut self, mm: &mut AddressSpaceManager, parent: Pid) -> Result<Pid, ForkError> {
        let (source, regs) = match self.get(parent) {
            Some(p) if p.is_runnable() && p.pid != Pid::RESERVED => match p.page_table {
                Some(root) => (root, p.regs),
                None => return Err(ForkError::InvalidParent(parent)),
            },
            _ => return Err(ForkError::InvalidParent(parent)),
        };
        let child = self
            .slots
            .iter()
            .skip(1)
            .find(|p| p.state == ProcState::Free)
            .map(|p| p.pid)
            .ok_or(ForkError::TableFull)?;

        let root = mm.duplicate(source, child)?;

        let slot = &mut self.slots[child.as_index()];
        slot.regs = regs;
        slot.regs.rax = 0;
        slot.page_table = Some(root);
        slot.state = ProcState::Runnable;
        self.slots[parent.as_index()].regs.rax = u64::from(child.as_raw());
        log_debug!(target: "task", "fork pid {} -> {}", parent, child);
        Ok(child)
    }

    /// Releases the address space of `pid` and returns its slot to the Free pool.
    pub fn exit(&mut self, mm: &mut AddressSpaceManager, pid: Pid) {
        let Some(slot) = self.slots.get_mut(pid.as_index()) else {
            return;
        };
        if slot.state == ProcState::Free {
            log_warn!(target: "task", "exit of free pid {}", pid);
            return;
        }
        if let Some(root) = slot.page_table.take() {
            if root == mm.kernel_root() {
                mm.detach_kernel();
            } else {
                mm.free(root);
            }
        }
        slot.state = ProcState::Free;

        let survivors: Vec<(Pid, PageNumber)> = self
            .slots
            .iter()
            .filter(|p| p.is_live())
            .filter_map(|p| p.page_table.map(|root| (p.pid, root)))
            .collect();
        let moved = mm.hand_over(pid, &survivors);
        log_debug!(target: "task", "exit pid {} (handed over {} shared pages)", pid, moved);
    }

    /// Marks `pid` Broken after a user-mode fault.
    pub fn mark_broken(&mut self, pid: Pid) {
        if let Some(slot) = self.slots.get_mut(pid.as_index()) {
            if slot.state == ProcState::Runnable {
                slot.state = ProcState::Broken;
            }
        }
    }
}

/// Runs the loader and maps the stack page just below the top of the address space.
fn load_image(
    mm: &mut AddressSpaceManager,
    root: PageNumber,
    pid: Pid,
    program: usize,
    loader: &mut impl ProgramLoader,
) -> Result<usize, SetupError> {
    let entry = loader.load(&mut LoadTarget::new(mm, root, pid), program)?;
    let stack_page = mm.layout().virtual_size - PAGE_SIZE;
    mm.map_page(root, stack_page, pid, PageFlags::USER_RW)?;
    Ok(entry)
}
