// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state, boot sequence and the single trap entry point
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{boot, start, exception, idle}, Resume, KernelPanic, BootError
//! DEPENDS_ON: hal::Hardware, mm, task, sched, syscall, trap, diag::memshow
//! INVARIANTS: Every trap runs on the kernel page table; the process resumed next has its own
//!             page table loaded; after a fatal trap the kernel stays halted

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::marker::PhantomData;

use thiserror::Error;

use crate::config::{BootCommand, ConfigError, KernelConfig};
use crate::diag::memshow;
use crate::hal::Hardware;
use crate::mm::verify::{check_virtual_memory, Violation};
use crate::mm::{AddressSpaceError, AddressSpaceManager, PageFlags};
use crate::sched::{Decision, Scheduler};
use crate::syscall::{self, api, Args, SyscallTable};
use crate::task::{ProcState, Process, ProcessTable, ProgramLoader, SetupError};
use crate::trap::{self, PageFault, Registers, TrapKind};
use crate::types::Pid;

/// Longest panic message read from user memory.
const PANIC_MESSAGE_MAX: usize = 160;

/// What the trap return path does next.
#[must_use = "the caller must resume the chosen context"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Restore the saved registers of this process on its page table.
    Run(Pid),
    /// Nothing is runnable; call [`Kernel::idle`] until something is.
    Idle,
    /// Stopped by an external abort.
    Halted,
}

/// Conditions that stop the machine.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KernelPanic {
    #[error("process {pid} panicked: {}", .message.as_deref().unwrap_or("(no message)"))]
    PanicRequest { pid: Pid, message: Option<String> },
    #[error("kernel page fault at {0}")]
    KernelPageFault(PageFault),
    #[error("unexpected trap {0}")]
    UnexpectedTrap(u64),
    #[error("memory invariant violated: {0}")]
    Invariant(Violation),
    #[error("kernel is halted")]
    Halted,
}

/// Errors that abort boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("kernel address space: {0}")]
    AddressSpace(#[from] AddressSpaceError),
    #[error("setup of pid {pid} failed: {source}")]
    Setup { pid: Pid, source: SetupError },
    #[error("memory invariant violated after boot: {0}")]
    Invariant(Violation),
}

/// Aggregated kernel state.
pub struct Kernel<H: Hardware> {
    config: KernelConfig,
    hal: H,
    address_spaces: AddressSpaceManager,
    tasks: ProcessTable,
    scheduler: Scheduler,
    syscalls: SyscallTable,
    halted: bool,
    // Single core with interrupts masked; the state never crosses threads.
    _not_send: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(Kernel<crate::hal::virt::SimMachine>: Send, Sync);

impl<H: Hardware> Kernel<H> {
    /// Builds the kernel mapping and the initial processes selected by `command`.
    pub fn boot(
        config: KernelConfig,
        mut hal: H,
        loader: &mut impl ProgramLoader,
        command: BootCommand,
    ) -> Result<Self, BootError> {
        config.validate()?;
        let address_spaces = AddressSpaceManager::new(config.layout)?;
        hal.set_page_table(address_spaces.kernel_root());

        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);

        let mut kernel = Self {
            config,
            hal,
            address_spaces,
            tasks: ProcessTable::new(config.nproc),
            scheduler: Scheduler::new(config.hz),
            syscalls,
            halted: false,
            _not_send: PhantomData,
        };
        for &(raw, program) in command.initial_processes() {
            let pid = Pid::from_raw(raw);
            kernel
                .tasks
                .setup(&mut kernel.address_spaces, pid, program, loader)
                .map_err(|source| BootError::Setup { pid, source })?;
        }
        if kernel.config.check_invariants {
            kernel.check_virtual_memory().map_err(BootError::Invariant)?;
        }
        log_info!(
            target: "boot",
            "weft: {} pages, {} process slots, {} Hz, {:?} boot",
            kernel.address_spaces.memory().npages(),
            kernel.config.nproc,
            kernel.config.hz,
            command
        );
        Ok(kernel)
    }

    /// First scheduling decision after boot: process 1 when it is runnable.
    pub fn start(&mut self) -> Resume {
        let first = Pid::from_raw(1);
        if self.tasks.state(first) == ProcState::Runnable {
            self.run(first)
        } else {
            self.schedule()
        }
    }

    /// Handles one trap or system call captured in `regs`.
    pub fn exception(&mut self, regs: &Registers) -> Result<Resume, KernelPanic> {
        if self.halted {
            return Err(KernelPanic::Halted);
        }
        trap::record(regs);
        let current = self.scheduler.current();
        if let Some(process) = self.tasks.get_mut(current) {
            if process.is_runnable() {
                *process.registers_mut() = *regs;
            }
        }
        self.hal.set_page_table(self.address_spaces.kernel_root());

        let kind = TrapKind::decode(regs.intno);
        let fault = match kind {
            TrapKind::PageFault => Some(PageFault::decode(regs, self.hal.fault_address())),
            _ => None,
        };
        let kernel_fault = fault.is_some_and(|f| !f.user);
        if !kernel_fault {
            if self.config.check_invariants {
                if let Err(violation) = self.check_virtual_memory() {
                    return Err(self.fatal(KernelPanic::Invariant(violation)));
                }
            }
            if crate::diag::log::enabled(crate::diag::log::Level::Trace, memshow::TARGET) {
                memshow::trace(&self.address_spaces, &self.tasks.views());
            }
        }
        if self.hal.poll_abort() {
            self.halted = true;
            log_warn!(target: "kmain", "abort requested; halting");
            return Ok(Resume::Halted);
        }

        match kind {
            TrapKind::SysPanic => {
                let message = self.read_user_string(current, regs.rdi as usize);
                return Err(self.fatal(KernelPanic::PanicRequest { pid: current, message }));
            }
            TrapKind::Timer => {
                self.scheduler.tick();
                return Ok(self.schedule());
            }
            TrapKind::PageFault => {
                let Some(fault) = fault else {
                    return Err(self.fatal(KernelPanic::UnexpectedTrap(regs.intno)));
                };
                if !fault.user {
                    return Err(self.fatal(KernelPanic::KernelPageFault(fault)));
                }
                log_warn!(target: "kmain", "process {} page fault for {}", current, fault);
                self.tasks.mark_broken(current);
            }
            TrapKind::Unknown(intno) => {
                return Err(self.fatal(KernelPanic::UnexpectedTrap(intno)));
            }
            _ => {
                if let Some(resume) = self.syscall(current, regs) {
                    return Ok(resume);
                }
            }
        }

        if self.tasks.state(current) == ProcState::Runnable {
            Ok(self.run(current))
        } else {
            Ok(self.schedule())
        }
    }

    /// Polled while [`Resume::Idle`]; retries scheduling unless an abort arrived.
    pub fn idle(&mut self) -> Resume {
        if self.halted {
            return Resume::Halted;
        }
        if self.hal.poll_abort() {
            self.halted = true;
            log_warn!(target: "kmain", "abort requested while idle; halting");
            return Resume::Halted;
        }
        self.schedule()
    }

    /// Runs the full memory invariant checker.
    pub fn check_virtual_memory(&self) -> Result<(), Violation> {
        check_virtual_memory(&self.address_spaces, &self.tasks.views())
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn address_spaces(&self) -> &AddressSpaceManager {
        &self.address_spaces
    }

    pub fn address_spaces_mut(&mut self) -> &mut AddressSpaceManager {
        &mut self.address_spaces
    }

    pub fn tasks(&self) -> &ProcessTable {
        &self.tasks
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.tasks.get(pid)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn current(&self) -> Pid {
        self.scheduler.current()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Dispatches a system call; `Some` when the trap already picked the next context.
    fn syscall(&mut self, current: Pid, regs: &Registers) -> Option<Resume> {
        if self.tasks.state(current) != ProcState::Runnable {
            log_warn!(target: "syscall", "{} from non-runnable pid {}", trap::describe(regs.intno), current);
            return Some(self.schedule());
        }
        let args = Args::from_registers(regs);
        let result = {
            let mut ctx = api::Context::new(&mut self.tasks, &mut self.address_spaces, current);
            self.syscalls.dispatch(regs.intno, &mut ctx, &args)
        };
        match result {
            Ok(value) => self.set_return(current, value),
            Err(syscall::Error::Reschedule) => return Some(self.schedule()),
            Err(syscall::Error::TaskExit) => {}
            Err(err) => {
                log_debug!(target: "syscall", "{} for pid {} failed: {}", trap::describe(regs.intno), current, err);
                self.set_return(current, syscall::encode_error(err));
            }
        }
        None
    }

    fn set_return(&mut self, pid: Pid, value: usize) {
        if let Some(process) = self.tasks.get_mut(pid) {
            process.registers_mut().rax = value as u64;
        }
    }

    fn schedule(&mut self) -> Resume {
        match self.scheduler.schedule(&self.tasks) {
            Decision::Run(pid) => self.run(pid),
            Decision::Idle => Resume::Idle,
        }
    }

    fn run(&mut self, pid: Pid) -> Resume {
        self.scheduler.set_current(pid);
        if let Some(root) = self.tasks.get(pid).and_then(Process::page_table) {
            self.hal.set_page_table(root);
        }
        Resume::Run(pid)
    }

    fn fatal(&mut self, panic: KernelPanic) -> KernelPanic {
        self.halted = true;
        log_error!(target: "kmain", "PANIC: {}", panic);
        if let Some(frame) = trap::last_trap() {
            let mut line = String::new();
            if trap::fmt_trap(&frame, &mut line).is_ok() {
                log_error!(target: "kmain", "{}", line);
            }
        }
        panic
    }

    /// Reads a NUL-terminated string at `va` from the address space of `pid`.
    ///
    /// Stops at the first byte that is not on a user-accessible page.
    fn read_user_string(&self, pid: Pid, va: usize) -> Option<String> {
        if va == 0 {
            return None;
        }
        let root = self.tasks.get(pid).and_then(Process::page_table)?;
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        while bytes.len() < PANIC_MESSAGE_MAX {
            let at = va + bytes.len();
            let user = self.address_spaces.lookup(root, at).is_some_and(|m| m.flags.contains(PageFlags::USER));
            if !user || self.address_spaces.copy_from_user(root, at, &mut byte).is_err() || byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Some(String::from_utf8_lossy(&bytes).to_string())
    }
}
