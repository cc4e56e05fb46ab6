// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Text rendering of physical memory and process address spaces
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: page_char(), physical_map(), virtual_map(), trace()
//! DEPENDS_ON: mm::{PhysicalMemory, AddressSpaceManager}
//! INVARIANTS: One character per page, 64 pages per row; rendering never mutates state

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::mm::verify::ProcessView;
use crate::mm::{AddressSpaceManager, Owner, PageFlags, PageInfo, PhysicalMemory, PAGE_SIZE};
use crate::types::PageNumber;

/// Log target used for memory map dumps.
pub const TARGET: &str = "memshow";

const PAGES_PER_ROW: usize = 64;

/// Character shown for one physical page.
pub fn page_char(info: PageInfo) -> char {
    match info.owner {
        Owner::Free => '.',
        Owner::Reserved => 'R',
        Owner::Kernel => 'K',
        Owner::Process(_) if info.refcount > 1 => '*',
        Owner::Process(pid) => char::from_digit(pid.as_raw() % 36, 36).map_or('?', |c| c.to_ascii_uppercase()),
    }
}

/// Physical memory, one row per 64 pages prefixed with the row's base address.
pub fn physical_map(mem: &PhysicalMemory) -> Vec<String> {
    let cells: Vec<char> = mem.snapshot().into_iter().map(page_char).collect();
    rows(&cells)
}

/// User-accessible pages of the address space rooted at `root`; blank where unmapped.
pub fn virtual_map(mm: &AddressSpaceManager, root: PageNumber) -> Vec<String> {
    let mem = mm.memory();
    let cells: Vec<char> = (0..mm.layout().virtual_size)
        .step_by(PAGE_SIZE)
        .map(|va| match mm.lookup(root, va) {
            Some(m) if m.flags.contains(PageFlags::USER) => mem.info(m.pn).map_or('?', page_char),
            _ => ' ',
        })
        .collect();
    rows(&cells)
}

fn rows(cells: &[char]) -> Vec<String> {
    cells
        .chunks(PAGES_PER_ROW)
        .enumerate()
        .map(|(row, chunk)| {
            let mut line = String::with_capacity(PAGES_PER_ROW + 10);
            let _ = write!(line, "{:#08x} ", row * PAGES_PER_ROW * PAGE_SIZE);
            line.extend(chunk.iter());
            line
        })
        .collect()
}

/// Emits the physical map and every live private address space at trace level.
pub fn trace(mm: &AddressSpaceManager, processes: &[ProcessView]) {
    log_trace!(target: TARGET, "physical memory");
    for line in physical_map(mm.memory()) {
        log_trace!(target: TARGET, "{}", line);
    }
    for view in processes.iter().filter(|p| p.live) {
        let Some(root) = view.root else { continue };
        log_trace!(target: TARGET, "virtual memory of pid {}", view.pid);
        for line in virtual_map(mm, root) {
            log_trace!(target: TARGET, "{}", line);
        }
    }
}
