// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error encoding
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult, encode_error
//! DEPENDS_ON: mm, task, syscall::api
//! INVARIANTS: Syscall numbers are trap vectors; results and errors travel in rax;
//!             errors are negative errno values

pub mod api;

use thiserror::Error;

use crate::mm::{AddressSpaceError, MapError};
use crate::task::ForkError;
use crate::trap::Registers;

/// Number of trap vectors the table can route.
const MAX_SYSCALL: usize = 64;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in rdi, rsi, rdx, r10, r8, r9.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    pub fn from_registers(regs: &Registers) -> Self {
        Self::new([
            regs.rdi as usize,
            regs.rsi as usize,
            regs.rdx as usize,
            regs.r10 as usize,
            regs.r8 as usize,
            regs.r9 as usize,
        ])
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    ///
    /// Only direct table users see this; the trap path rejects unknown trap numbers as fatal
    /// before dispatch.
    #[error("invalid syscall")]
    InvalidSyscall,
    /// Address-space manager reported an error.
    #[error("address space: {0}")]
    AddressSpace(AddressSpaceError),
    /// Fork failed.
    #[error("fork: {0}")]
    Fork(ForkError),
    /// Current process terminated and must not resume.
    #[error("task exited")]
    TaskExit,
    /// Hand the CPU to the scheduler without writing a return value.
    #[error("reschedule")]
    Reschedule,
}

impl From<AddressSpaceError> for Error {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<ForkError> for Error {
    fn from(value: ForkError) -> Self {
        Self::Fork(value)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by trap number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    pub fn register(&mut self, number: u64, handler: Handler) {
        if let Some(slot) = self.handlers.get_mut(number as usize) {
            *slot = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: u64, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number as usize)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

const ENOMEM: usize = 12;
const EAGAIN: usize = 11;
const EEXIST: usize = 17;
const EINVAL: usize = 22;
const ENOSYS: usize = 38;

/// Encodes `err` as the value left in the caller's return register.
pub fn encode_error(err: Error) -> usize {
    match err {
        Error::InvalidSyscall => errno(ENOSYS),
        Error::AddressSpace(as_err) => address_space_errno(&as_err),
        Error::Fork(ForkError::TableFull) => errno(EAGAIN),
        Error::Fork(ForkError::InvalidParent(_)) => errno(EINVAL),
        Error::Fork(ForkError::AddressSpace(as_err)) => address_space_errno(&as_err),
        Error::TaskExit | Error::Reschedule => 0,
    }
}

fn address_space_errno(err: &AddressSpaceError) -> usize {
    match err {
        AddressSpaceError::OutOfMemory | AddressSpaceError::Mapping(MapError::OutOfMemory) => errno(ENOMEM),
        AddressSpaceError::AlreadyMapped(_) | AddressSpaceError::Mapping(MapError::Overlap) => errno(EEXIST),
        AddressSpaceError::InvalidAddress(_)
        | AddressSpaceError::NotMapped(_)
        | AddressSpaceError::Mapping(_) => errno(EINVAL),
    }
}

const fn errno(code: usize) -> usize {
    (-(code as isize)) as usize
}
