// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical page arena, x86-64 page tables and per-process address spaces
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysicalMemory, Owner, PageFlags, AddressSpaceManager, verify::check_virtual_memory
//! DEPENDS_ON: config::MemoryLayout, bitflags
//! INVARIANTS: refcount == 0 <=> owner == Free; table pointers are page numbers into the arena;
//!             every process table is the fixed six-page skeleton plus lazily added levels

use bitflags::bitflags;

pub mod address_space;
pub mod page_table;
pub mod phys;
pub mod verify;

pub use address_space::{AddressSpaceError, AddressSpaceManager};
pub use page_table::{Leaf, MapError, Mapping, NoAlloc, OwnedPages, PageSource};
pub use phys::{AllocError, AssignError, Owner, PageInfo, PhysicalMemory};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per x86-64 page table.
pub const PT_ENTRIES: usize = 512;
/// Depth of the page-table tree.
pub const PT_LEVELS: usize = 4;
/// Leaf tables installed by the standard skeleton (one per 2 MiB of virtual space).
pub const SKELETON_LEAF_TABLES: usize = 3;
/// Table pages in the standard skeleton: top, middle, lower directory and the leaf tables.
pub const SKELETON_PAGES: usize = 3 + SKELETON_LEAF_TABLES;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    /// Permission bits stored in an x86-64 PTE.
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl PageFlags {
    /// Flags used for interior (non-leaf) entries.
    pub const TABLE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
    /// Present, writable, user accessible.
    pub const USER_RW: Self = Self::TABLE;
    /// Present and writable, user access denied.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
    /// Present and readable by user mode, not writable.
    pub const USER_RO: Self = Self::PRESENT.union(Self::USER);
}

/// Rounds `value` up to the next page boundary.
#[inline]
pub const fn page_round_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Rounds `value` down to a page boundary.
#[inline]
pub const fn page_round_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests_prop;
