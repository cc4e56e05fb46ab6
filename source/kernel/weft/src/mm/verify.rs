// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Read-only consistency checks over page metadata and page-table trees
//! OWNERS: @kernel-mm-team
//! PUBLIC API: check_virtual_memory(mm, processes), ProcessView, Violation
//! DEPENDS_ON: mm::{phys, page_table}
//! INVARIANTS: Never mutates; reports the first mismatch found
//!
//! Checks, in order:
//! - slot 0 is free and no page was released or retained while free
//! - `refcount == 0 <=> owner == Free` for every page
//! - kernel image and stack are identity-mapped and writable in every live table
//! - table pages carry their address space's owner tag; the kernel root is referenced once
//!   plus once per live process still using it, every other table page exactly once
//! - no live page is tagged with a pid whose slot is free
//! - every refcount equals its base reference plus the entries and descriptors naming it

extern crate alloc;

use alloc::vec;

use thiserror::Error;

use super::page_table::{self, collect_tables, entry_flags, entry_page};
use super::phys::{Owner, PhysicalMemory};
use super::{AddressSpaceManager, PageFlags, PAGE_SIZE, PT_ENTRIES, PT_LEVELS};
use crate::config::MemoryLayout;
use crate::types::{PageNumber, Pid};

/// What the checker needs to know about one process slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessView {
    pub pid: Pid,
    /// Runnable or Broken.
    pub live: bool,
    pub root: Option<PageNumber>,
}

/// First inconsistency found by [`check_virtual_memory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("reserved process slot 0 is in use")]
    ReservedSlotInUse,
    #[error("page {0} was released or retained while free")]
    DoubleRelease(PageNumber),
    #[error("page {pn}: owner {owner} with refcount {refcount}")]
    RefcountOwnerMismatch { pn: PageNumber, owner: Owner, refcount: u32 },
    #[error("table page {0} lies outside physical memory")]
    TableOutOfRange(PageNumber),
    #[error("table page {pn}: expected owner {expected}, found {found}")]
    TableOwner { pn: PageNumber, expected: Owner, found: Owner },
    #[error("table page {pn}: expected refcount {expected}, found {found}")]
    TableRefcount { pn: PageNumber, expected: u32, found: u32 },
    #[error("table {root}: kernel address {va:#x} is not identity mapped")]
    KernelNotIdentity { root: PageNumber, va: usize },
    #[error("table {root}: kernel address {va:#x} is not writable")]
    KernelReadOnly { root: PageNumber, va: usize },
    #[error("page {pn} is owned by pid {pid}, whose slot is free")]
    Orphan { pn: PageNumber, pid: Pid },
    #[error("page {pn}: {found} references recorded, {expected} found in page tables")]
    Census { pn: PageNumber, expected: u32, found: u32 },
}

/// Runs every check against the current memory state.
pub fn check_virtual_memory(mm: &AddressSpaceManager, processes: &[ProcessView]) -> Result<(), Violation> {
    let mem = mm.memory();
    let kernel_root = mm.kernel_root();

    if processes.iter().any(|p| p.pid == Pid::RESERVED && p.live) {
        return Err(Violation::ReservedSlotInUse);
    }
    if let Some(pn) = mem.violations().first() {
        return Err(Violation::DoubleRelease(*pn));
    }
    check_page_info(mem)?;

    let on_kernel_table = processes.iter().filter(|p| p.live && p.root == Some(kernel_root)).count() as u32;
    check_page_table_mappings(mem, mm.layout(), kernel_root)?;
    check_page_table_ownership(mem, kernel_root, 0, Owner::Kernel, 1 + on_kernel_table)?;

    for view in private_tables(processes, kernel_root) {
        let (pid, root) = view;
        check_page_table_mappings(mem, mm.layout(), root)?;
        check_page_table_ownership(mem, root, 0, Owner::Process(pid), 1)?;
    }

    check_orphans(mem, processes)?;
    check_census(mem, kernel_root, processes, on_kernel_table)
}

fn private_tables(processes: &[ProcessView], kernel_root: PageNumber) -> impl Iterator<Item = (Pid, PageNumber)> + '_ {
    processes.iter().filter(|p| p.live).filter_map(move |p| match p.root {
        Some(root) if root != kernel_root => Some((p.pid, root)),
        _ => None,
    })
}

fn check_page_info(mem: &PhysicalMemory) -> Result<(), Violation> {
    for index in 0..mem.npages() {
        let pn = PageNumber::new(index);
        let (owner, refcount) = (mem.owner(pn), mem.refcount(pn));
        if (refcount == 0) != (owner == Owner::Free) {
            return Err(Violation::RefcountOwnerMismatch { pn, owner, refcount });
        }
    }
    Ok(())
}

/// Kernel image and kernel stack must be identity-mapped and writable in `root`.
pub fn check_page_table_mappings(mem: &PhysicalMemory, layout: &MemoryLayout, root: PageNumber) -> Result<(), Violation> {
    let stack = layout.kernel_stack_page();
    let image = (layout.kernel_start..layout.kernel_end).step_by(PAGE_SIZE);
    for va in image.chain(core::iter::once(stack)) {
        let mapping = page_table::lookup(mem, root, va);
        match mapping {
            Some(m) if m.pa().raw() == va => {
                if !m.flags.contains(PageFlags::WRITABLE) {
                    return Err(Violation::KernelReadOnly { root, va });
                }
            }
            _ => return Err(Violation::KernelNotIdentity { root, va }),
        }
    }
    Ok(())
}

/// Recursively checks owner and refcount of table pages; children must be referenced once.
pub fn check_page_table_ownership(
    mem: &PhysicalMemory,
    table: PageNumber,
    level: usize,
    owner: Owner,
    refcount: u32,
) -> Result<(), Violation> {
    let info = mem.info(table).ok_or(Violation::TableOutOfRange(table))?;
    if info.owner != owner {
        return Err(Violation::TableOwner { pn: table, expected: owner, found: info.owner });
    }
    if info.refcount != refcount {
        return Err(Violation::TableRefcount { pn: table, expected: refcount, found: info.refcount });
    }
    if level < PT_LEVELS - 1 {
        for index in 0..PT_ENTRIES {
            let entry = mem.read_entry(table, index);
            if entry_flags(entry).contains(PageFlags::PRESENT) {
                check_page_table_ownership(mem, entry_page(entry), level + 1, owner, 1)?;
            }
        }
    }
    Ok(())
}

fn check_orphans(mem: &PhysicalMemory, processes: &[ProcessView]) -> Result<(), Violation> {
    for index in 0..mem.npages() {
        let pn = PageNumber::new(index);
        if let Owner::Process(pid) = mem.owner(pn) {
            let live = processes.iter().any(|p| p.pid == pid && p.live);
            if !live {
                return Err(Violation::Orphan { pn, pid });
            }
        }
    }
    Ok(())
}

fn check_census(
    mem: &PhysicalMemory,
    kernel_root: PageNumber,
    processes: &[ProcessView],
    on_kernel_table: u32,
) -> Result<(), Violation> {
    let mut expected = vec![0u32; mem.npages()];
    for (index, slot) in expected.iter_mut().enumerate() {
        *slot = match mem.owner(PageNumber::new(index)) {
            Owner::Kernel | Owner::Reserved => 1,
            Owner::Free | Owner::Process(_) => 0,
        };
    }
    if let Some(slot) = expected.get_mut(kernel_root.as_index()) {
        *slot += on_kernel_table;
    }
    for (_, root) in private_tables(processes, kernel_root) {
        if let Some(slot) = expected.get_mut(root.as_index()) {
            *slot += 1;
        }
        for (_, table) in collect_tables(mem, root) {
            for index in 0..PT_ENTRIES {
                let entry = mem.read_entry(table, index);
                if !entry_flags(entry).contains(PageFlags::PRESENT) {
                    continue;
                }
                let target = entry_page(entry);
                let slot = expected.get_mut(target.as_index()).ok_or(Violation::TableOutOfRange(target))?;
                *slot += 1;
            }
        }
    }
    for (index, want) in expected.into_iter().enumerate() {
        let pn = PageNumber::new(index);
        let found = mem.refcount(pn);
        if found != want {
            return Err(Violation::Census { pn, expected: want, found });
        }
    }
    Ok(())
}
