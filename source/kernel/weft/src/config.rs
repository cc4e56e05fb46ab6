// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed machine layout and boot knobs
//! OWNERS: @kernel-team
//! PUBLIC API: MemoryLayout, KernelConfig, BootCommand, ConfigError
//! INVARIANTS: Layout constants are page aligned; the virtual range fits the six-page skeleton
//!
//! The physical layout mirrors the machine the kernel boots on:
//!
//! ```text
//! +-----+--------------------+----------------+--------------------+---------/
//! |     | Kernel      Kernel |       :    I/O | App 1        App 1 | App 2
//! |     | Code + Data  Stack |  ...  : Memory | Code + Data  Stack | Code ...
//! +-----+--------------------+----------------+--------------------+---------/
//! 0  0x40000              0x80000 0xA0000 0x100000             0x140000
//!                                             ^
//!                                             | process start boundary
//! ```

use thiserror::Error;

use crate::mm::{PAGE_SIZE, SKELETON_LEAF_TABLES};

/// Bytes covered by one leaf page table (512 entries of one page each).
pub const LEAF_TABLE_SPAN: usize = 512 * PAGE_SIZE;

/// Errors reported while validating a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A layout boundary is not page aligned.
    #[error("layout boundary {0:#x} is not page aligned")]
    Unaligned(usize),
    /// Regions overlap or are out of order.
    #[error("layout regions are out of order: {0}")]
    Disordered(&'static str),
    /// Virtual range exceeds what the fixed table skeleton can address.
    #[error("virtual size {0:#x} exceeds the addressable skeleton range")]
    VirtualTooLarge(usize),
    /// Process table must hold the reserved slot plus at least one process.
    #[error("process table needs at least two slots, got {0}")]
    TooFewSlots(usize),
    /// Timer frequency must be non-zero.
    #[error("timer frequency must be non-zero")]
    ZeroHz,
}

/// Physical and virtual memory layout constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Total physical memory in bytes.
    pub physical_size: usize,
    /// Size of every process virtual address space in bytes.
    pub virtual_size: usize,
    /// First byte of kernel code and data.
    pub kernel_start: usize,
    /// One past the last byte of kernel code and data.
    pub kernel_end: usize,
    /// Top of the kernel stack; the page below it belongs to the kernel.
    pub kernel_stack_top: usize,
    /// Start of the memory-mapped I/O hole.
    pub io_start: usize,
    /// End of the memory-mapped I/O hole.
    pub io_end: usize,
    /// Console page, mapped user-accessible.
    pub console: usize,
    /// Virtual addresses at or above this boundary belong to the process.
    pub proc_start: usize,
}

impl MemoryLayout {
    pub const fn new() -> Self {
        Self {
            physical_size: 0x20_0000,
            virtual_size: 0x30_0000,
            kernel_start: 0x4_0000,
            kernel_end: 0x5_0000,
            kernel_stack_top: 0x8_0000,
            io_start: 0xA_0000,
            io_end: 0x10_0000,
            console: 0xB_8000,
            proc_start: 0x10_0000,
        }
    }

    /// Number of physical pages.
    pub const fn npages(&self) -> usize {
        self.physical_size / PAGE_SIZE
    }

    /// Physical page holding the kernel stack.
    pub const fn kernel_stack_page(&self) -> usize {
        self.kernel_stack_top - PAGE_SIZE
    }

    /// Whether physical address `addr` is hardware reserved (null page, I/O hole).
    pub const fn is_reserved(&self, addr: usize) -> bool {
        addr < PAGE_SIZE || (addr >= self.io_start && addr < self.io_end)
    }

    /// Whether physical address `addr` holds kernel code, data or stack.
    pub const fn is_kernel(&self, addr: usize) -> bool {
        (addr >= self.kernel_start && addr < self.kernel_end) || addr == self.kernel_stack_page()
    }

    /// Whether virtual address `va` lies in the per-process region.
    pub const fn is_user(&self, va: usize) -> bool {
        va >= self.proc_start && va < self.virtual_size
    }

    /// Checks alignment and ordering of every boundary.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for addr in [
            self.physical_size,
            self.virtual_size,
            self.kernel_start,
            self.kernel_end,
            self.kernel_stack_top,
            self.io_start,
            self.io_end,
            self.console,
            self.proc_start,
        ] {
            if addr % PAGE_SIZE != 0 {
                return Err(ConfigError::Unaligned(addr));
            }
        }
        if self.kernel_start < PAGE_SIZE || self.kernel_end <= self.kernel_start {
            return Err(ConfigError::Disordered("kernel image"));
        }
        if self.kernel_stack_top <= self.kernel_end || self.kernel_stack_top > self.io_start {
            return Err(ConfigError::Disordered("kernel stack"));
        }
        if self.io_end <= self.io_start || self.io_end > self.proc_start {
            return Err(ConfigError::Disordered("i/o hole"));
        }
        if self.console < self.io_start || self.console >= self.io_end {
            return Err(ConfigError::Disordered("console outside i/o hole"));
        }
        if self.proc_start >= self.virtual_size || self.proc_start > self.physical_size {
            return Err(ConfigError::Disordered("process start boundary"));
        }
        if self.virtual_size > SKELETON_LEAF_TABLES * LEAF_TABLE_SPAN {
            return Err(ConfigError::VirtualTooLarge(self.virtual_size));
        }
        Ok(())
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel-wide configuration fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub layout: MemoryLayout,
    /// Number of process slots including the reserved slot 0.
    pub nproc: usize,
    /// Timer interrupt frequency.
    pub hz: u32,
    /// Run the invariant checker on every trap.
    pub check_invariants: bool,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            layout: MemoryLayout::new(),
            nproc: 16,
            hz: 100,
            check_invariants: cfg!(any(debug_assertions, feature = "debug_pt_verify")),
        }
    }

    pub fn with_nproc(mut self, nproc: usize) -> Self {
        self.nproc = nproc;
        self
    }

    pub fn with_layout(mut self, layout: MemoryLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_invariant_checks(mut self, enabled: bool) -> Self {
        self.check_invariants = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()?;
        if self.nproc < 2 {
            return Err(ConfigError::TooFewSlots(self.nproc));
        }
        if self.hz == 0 {
            return Err(ConfigError::ZeroHz);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Initial process set selected by the boot command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootCommand {
    /// Processes 1-4 running programs 0-3.
    Default,
    /// Process 1 running the fork test program (4).
    Fork,
    /// Process 1 running the fork/exit test program (5).
    ForkExit,
}

impl BootCommand {
    /// Parses the optional boot loader command string.
    pub fn parse(command: Option<&str>) -> Self {
        match command {
            Some("fork") => Self::Fork,
            Some("forkexit") => Self::ForkExit,
            _ => Self::Default,
        }
    }

    /// `(pid, program)` pairs to set up at boot.
    pub fn initial_processes(self) -> &'static [(u32, usize)] {
        match self {
            Self::Default => &[(1, 0), (2, 1), (3, 2), (4, 3)],
            Self::Fork => &[(1, 4)],
            Self::ForkExit => &[(1, 5)],
        }
    }
}
