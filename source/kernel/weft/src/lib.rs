// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-management and process-scheduling core of the WEFT kernel
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (boot/exception/idle), config, mm, task, sched, trap, syscall, hal
//! DEPENDS_ON: bitflags, spin, log, thiserror, static_assertions
//! INVARIANTS: Single core, interrupts masked while the core runs; every physical page has one
//!             owner tag and a refcount equal to the page-table references to it

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod config;
pub mod hal;
pub mod kmain;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;

pub use config::{BootCommand, ConfigError, KernelConfig, MemoryLayout};
pub use kmain::{BootError, Kernel, KernelPanic, Resume};
pub use types::{PageNumber, PhysAddr, Pid, VirtAddr};
