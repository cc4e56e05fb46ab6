// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel mapping, address-space duplication and teardown over the page arena.

extern crate alloc;

use alloc::vec::Vec;

use thiserror::Error;

use super::page_table::{
    self, collect_leaves, collect_tables, entry_flags, entry_page, make_entry, Leaf, MapError, Mapping,
    OwnedPages, VA_LIMIT,
};
use super::phys::{AllocError, Owner, PhysicalMemory};
use super::{PageFlags, PAGE_SIZE, PT_ENTRIES, PT_LEVELS, SKELETON_PAGES};
use crate::config::MemoryLayout;
use crate::types::{PageNumber, PhysAddr, Pid, VirtAddr};

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    /// No physical page was available.
    #[error("out of physical memory")]
    OutOfMemory,
    /// Underlying map operation failed.
    #[error("mapping failed: {0}")]
    Mapping(MapError),
    /// Address is unaligned or outside the process region.
    #[error("invalid user address {0:#x}")]
    InvalidAddress(usize),
    /// A mapping already exists at the address.
    #[error("address {0:#x} is already mapped")]
    AlreadyMapped(usize),
    /// No mapping exists at the address.
    #[error("address {0:#x} is not mapped")]
    NotMapped(usize),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            other => Self::Mapping(other),
        }
    }
}

impl From<AllocError> for AddressSpaceError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

/// Owns physical memory and the shared kernel page table.
pub struct AddressSpaceManager {
    mem: PhysicalMemory,
    layout: MemoryLayout,
    kernel_root: PageNumber,
}

impl AddressSpaceManager {
    /// Initialises page metadata and builds the kernel mapping.
    pub fn new(layout: MemoryLayout) -> Result<Self, AddressSpaceError> {
        let mut mem = PhysicalMemory::new(&layout);
        let kernel_root = build_kernel_mapping(&mut mem, &layout)?;
        Ok(Self { mem, layout, kernel_root })
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.mem
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Root page of the shared kernel page table.
    pub fn kernel_root(&self) -> PageNumber {
        self.kernel_root
    }

    /// Takes a reference on the kernel table for a descriptor that uses it directly.
    pub fn attach_kernel(&mut self) -> PageNumber {
        self.mem.retain(self.kernel_root);
        self.kernel_root
    }

    /// Drops a descriptor's reference on the kernel table.
    pub fn detach_kernel(&mut self) {
        self.mem.release(self.kernel_root);
    }

    /// Builds a private address space for `owner` from the table rooted at `source`.
    ///
    /// Kernel-region mappings are shared. When `source` is not the kernel table, user
    /// pages are carried over: writable pages are copied eagerly, read-only pages are
    /// shared. On failure nothing allocated by this call survives.
    pub fn duplicate(&mut self, source: PageNumber, owner: Pid) -> Result<PageNumber, AddressSpaceError> {
        let tag = Owner::Process(owner);
        let mut skeleton = [PageNumber::new(0); SKELETON_PAGES];
        for index in 0..SKELETON_PAGES {
            match self.mem.allocate(tag) {
                Ok(pn) => skeleton[index] = pn,
                Err(_) => {
                    for pn in &skeleton[..index] {
                        self.mem.release(*pn);
                    }
                    log_warn!(target: "mm", "duplicate: skeleton allocation failed for pid {}", owner);
                    return Err(AddressSpaceError::OutOfMemory);
                }
            }
        }
        let root = skeleton[0];
        self.mem.write_entry(skeleton[0], 0, make_entry(skeleton[1], PageFlags::TABLE));
        self.mem.write_entry(skeleton[1], 0, make_entry(skeleton[2], PageFlags::TABLE));
        for (index, leaf_table) in skeleton[3..].iter().enumerate() {
            self.mem.write_entry(skeleton[2], index, make_entry(*leaf_table, PageFlags::TABLE));
        }

        if let Err(err) = self.populate(source, root, tag) {
            release_tree(&mut self.mem, root, 0);
            log_warn!(target: "mm", "duplicate: rolled back address space for pid {}: {}", owner, err);
            return Err(err);
        }
        log_debug!(target: "mm", "duplicate: pid {} root={} from {}", owner, root, source);
        Ok(root)
    }

    fn populate(&mut self, source: PageNumber, root: PageNumber, tag: Owner) -> Result<(), AddressSpaceError> {
        let mut tables = OwnedPages(tag);
        for leaf in collect_leaves(&self.mem, source, 0..self.layout.proc_start) {
            let Mapping { pn, flags } = leaf.mapping;
            page_table::map(&mut self.mem, root, leaf.va, pn.addr().raw(), PAGE_SIZE, flags, &mut tables)?;
            self.mem.retain(pn);
        }
        if source == self.kernel_root {
            return Ok(());
        }
        for leaf in collect_leaves(&self.mem, source, self.layout.proc_start..VA_LIMIT) {
            let Mapping { pn, flags } = leaf.mapping;
            if !flags.contains(PageFlags::PRESENT | PageFlags::USER) {
                continue;
            }
            let target = if flags.contains(PageFlags::WRITABLE) {
                let copy = self.mem.allocate(tag)?;
                self.mem.copy_frame(pn, copy);
                copy
            } else {
                self.mem.retain(pn);
                pn
            };
            let mapped =
                page_table::map(&mut self.mem, root, leaf.va, target.addr().raw(), PAGE_SIZE, flags, &mut tables);
            if let Err(err) = mapped {
                self.mem.release(target);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Releases every page referenced by the table rooted at `root`, then the table pages.
    ///
    /// The kernel table is never freed. Calling this twice on one table is a caller error.
    pub fn free(&mut self, root: PageNumber) {
        if root == self.kernel_root {
            log_warn!(target: "mm", "free: refusing to free the kernel page table");
            return;
        }
        release_tree(&mut self.mem, root, 0);
    }

    /// Allocates a zeroed page for `owner` and maps it at `va` with `flags`.
    pub fn map_page(
        &mut self,
        root: PageNumber,
        va: usize,
        owner: Pid,
        flags: PageFlags,
    ) -> Result<PageNumber, AddressSpaceError> {
        if va % PAGE_SIZE != 0 {
            return Err(AddressSpaceError::InvalidAddress(va));
        }
        if page_table::lookup(&self.mem, root, va).is_some() {
            return Err(AddressSpaceError::AlreadyMapped(va));
        }
        let tag = Owner::Process(owner);
        let pn = self.mem.allocate(tag)?;
        if let Err(err) = page_table::map(&mut self.mem, root, va, pn.addr().raw(), PAGE_SIZE, flags, &mut OwnedPages(tag)) {
            self.mem.release(pn);
            return Err(err.into());
        }
        Ok(pn)
    }

    /// Maps `[va, va + size)` to existing physical pages; intermediate tables belong to `owner`.
    pub fn map(
        &mut self,
        root: PageNumber,
        va: usize,
        pa: PhysAddr,
        size: usize,
        flags: PageFlags,
        owner: Owner,
    ) -> Result<(), AddressSpaceError> {
        page_table::map(&mut self.mem, root, va, pa.raw(), size, flags, &mut OwnedPages(owner))
            .map_err(AddressSpaceError::from)
    }

    pub fn lookup(&self, root: PageNumber, va: usize) -> Option<Mapping> {
        page_table::lookup(&self.mem, root, va)
    }

    /// Physical address backing `va`, including the page offset.
    pub fn translate(&self, root: PageNumber, va: usize) -> Option<PhysAddr> {
        self.lookup(root, va).map(|m| PhysAddr::new(m.pa().raw() + va % PAGE_SIZE))
    }

    /// Present leaves at or above the process start boundary.
    pub fn user_leaves(&self, root: PageNumber) -> Vec<Leaf> {
        collect_leaves(&self.mem, root, self.layout.proc_start..VA_LIMIT)
    }

    /// Writes `bytes` at `va` through the table rooted at `root`.
    ///
    /// Fails without writing anything when part of the range is unmapped.
    pub fn copy_to_user(&mut self, root: PageNumber, va: usize, bytes: &[u8]) -> Result<(), AddressSpaceError> {
        let chunks = self.chunks(root, va, bytes.len())?;
        let mut done = 0;
        for (pn, offset, len) in chunks {
            self.mem.frame_mut(pn)[offset..offset + len].copy_from_slice(&bytes[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `va` through the table rooted at `root`.
    pub fn copy_from_user(&self, root: PageNumber, va: usize, buf: &mut [u8]) -> Result<(), AddressSpaceError> {
        let chunks = self.chunks(root, va, buf.len())?;
        let mut done = 0;
        for (pn, offset, len) in chunks {
            buf[done..done + len].copy_from_slice(&self.mem.frame(pn)[offset..offset + len]);
            done += len;
        }
        Ok(())
    }

    fn chunks(&self, root: PageNumber, va: usize, len: usize) -> Result<Vec<(PageNumber, usize, usize)>, AddressSpaceError> {
        let end = va.checked_add(len).ok_or(AddressSpaceError::InvalidAddress(va))?;
        let mut out = Vec::new();
        let mut cursor = va;
        while cursor < end {
            let offset = VirtAddr::new(cursor).ok_or(AddressSpaceError::InvalidAddress(cursor))?.page_offset();
            let take = (PAGE_SIZE - offset).min(end - cursor);
            let mapping = self.lookup(root, cursor).ok_or(AddressSpaceError::NotMapped(cursor))?;
            out.push((mapping.pn, offset, take));
            cursor += take;
        }
        Ok(out)
    }

    /// Re-tags user pages still owned by `from` to a live process that maps them.
    ///
    /// Returns the number of pages handed over.
    pub fn hand_over(&mut self, from: Pid, survivors: &[(Pid, PageNumber)]) -> usize {
        let mut moved = 0;
        for &(pid, root) in survivors {
            for leaf in self.user_leaves(root) {
                if self.mem.owner(leaf.mapping.pn) == Owner::Process(from) {
                    self.mem.set_owner(leaf.mapping.pn, Owner::Process(pid));
                    moved += 1;
                }
            }
        }
        moved
    }
}

/// Identity-maps the kernel image, kernel stack and reserved pages below the process
/// boundary. Page 0 stays unmapped; the console page is user accessible.
pub fn build_kernel_mapping(mem: &mut PhysicalMemory, layout: &MemoryLayout) -> Result<PageNumber, AddressSpaceError> {
    let root = mem.allocate(Owner::Kernel)?;
    let mut tables = OwnedPages(Owner::Kernel);
    let mut mapped = 0usize;
    for addr in (PAGE_SIZE..layout.proc_start).step_by(PAGE_SIZE) {
        if !layout.is_kernel(addr) && !layout.is_reserved(addr) {
            continue;
        }
        let flags = if addr == layout.console { PageFlags::USER_RW } else { PageFlags::KERNEL_RW };
        if let Err(err) = page_table::map(mem, root, addr, addr, PAGE_SIZE, flags, &mut tables) {
            // Leaves here carry no extra reference; only the tables go back.
            for (_, table) in collect_tables(mem, root) {
                mem.release(table);
            }
            log_error!(target: "mm", "kernel mapping failed at {:#x}: {}", addr, err);
            return Err(err.into());
        }
        mapped += 1;
    }
    log_info!(target: "mm", "kernel mapping: root={} pages={}", root, mapped);
    Ok(root)
}

fn release_tree(mem: &mut PhysicalMemory, table: PageNumber, level: usize) {
    for index in 0..PT_ENTRIES {
        let entry = mem.read_entry(table, index);
        if !entry_flags(entry).contains(PageFlags::PRESENT) {
            continue;
        }
        let next = entry_page(entry);
        if level < PT_LEVELS - 1 {
            release_tree(mem, next, level + 1);
        } else {
            mem.release(next);
        }
    }
    mem.release(table);
}
