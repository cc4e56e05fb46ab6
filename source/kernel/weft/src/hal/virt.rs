// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-simulated machine used by tests and by the memory-map tooling.

use super::Hardware;
use crate::types::PageNumber;

/// Simulated CPU state visible to the kernel core.
#[derive(Debug, Default)]
pub struct SimMachine {
    active: Option<PageNumber>,
    fault_addr: usize,
    abort: bool,
    table_loads: u64,
}

impl SimMachine {
    pub const fn new() -> Self {
        Self { active: None, fault_addr: 0, abort: false, table_loads: 0 }
    }

    /// Page table currently loaded.
    pub fn active_page_table(&self) -> Option<PageNumber> {
        self.active
    }

    /// Number of page-table switches performed so far.
    pub fn table_loads(&self) -> u64 {
        self.table_loads
    }

    /// Sets the address reported for the next page fault.
    pub fn set_fault_address(&mut self, addr: usize) {
        self.fault_addr = addr;
    }

    /// Simulates an abort key press.
    pub fn request_abort(&mut self) {
        self.abort = true;
    }
}

impl Hardware for SimMachine {
    fn set_page_table(&mut self, root: PageNumber) {
        self.active = Some(root);
        self.table_loads += 1;
    }

    fn fault_address(&self) -> usize {
        self.fault_addr
    }

    fn poll_abort(&mut self) -> bool {
        self.abort
    }
}
