// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod virt;

use crate::types::PageNumber;

/// Machine services the kernel core needs while handling a trap.
pub trait Hardware {
    /// Makes the page table rooted at `root` active (CR3 on x86-64).
    fn set_page_table(&mut self, root: PageNumber);
    /// Returns the faulting virtual address of the last page fault (CR2).
    fn fault_address(&self) -> usize;
    /// Returns `true` once an external abort (Control-C on the console) was requested.
    fn poll_abort(&mut self) -> bool;
}
