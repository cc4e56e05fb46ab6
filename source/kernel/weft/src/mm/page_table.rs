// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! x86-64 four-level page tables stored in arena pages, with lazy allocation of
//! intermediate levels.

extern crate alloc;

use alloc::vec::Vec;
use core::ops::Range;

use thiserror::Error;

use super::phys::{Owner, PhysicalMemory};
use super::{PageFlags, PAGE_SIZE, PT_ENTRIES, PT_LEVELS};
use crate::types::{PageNumber, PhysAddr};

/// Bits of an entry holding the physical address.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// One past the highest canonical lower-half address.
pub const VA_LIMIT: usize = 1 << 47;

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MapError {
    /// Virtual address, physical address or size is not page aligned.
    #[error("unaligned mapping")]
    Unaligned,
    /// Mapping extends beyond the virtual or physical range.
    #[error("mapping out of range")]
    OutOfRange,
    /// Flags do not describe a present entry.
    #[error("invalid mapping flags")]
    InvalidFlags,
    /// Mapping collides with an existing entry.
    #[error("mapping overlaps an existing entry")]
    Overlap,
    /// An intermediate table is missing and the page source may not allocate.
    #[error("intermediate page table missing")]
    MissingTable,
    /// The page source could not supply an intermediate table.
    #[error("out of memory for page tables")]
    OutOfMemory,
}

/// Supplies pages for intermediate tables created by [`map`].
pub trait PageSource {
    /// Returns a zeroed page with refcount 1.
    fn table_page(&mut self, mem: &mut PhysicalMemory) -> Result<PageNumber, MapError>;
}

/// Page source that never allocates; mapping requires the tables to exist.
pub struct NoAlloc;

impl PageSource for NoAlloc {
    fn table_page(&mut self, _mem: &mut PhysicalMemory) -> Result<PageNumber, MapError> {
        Err(MapError::MissingTable)
    }
}

/// Page source allocating from the arena on behalf of an owner.
pub struct OwnedPages(pub Owner);

impl PageSource for OwnedPages {
    fn table_page(&mut self, mem: &mut PhysicalMemory) -> Result<PageNumber, MapError> {
        mem.allocate(self.0).map_err(|_| MapError::OutOfMemory)
    }
}

/// Result of a successful lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub pn: PageNumber,
    /// Effective permissions: the intersection along the walk.
    pub flags: PageFlags,
}

impl Mapping {
    pub const fn pa(&self) -> PhysAddr {
        self.pn.addr()
    }
}

/// A present leaf entry found by [`collect_leaves`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub va: usize,
    pub mapping: Mapping,
}

#[inline]
pub const fn entry_page(entry: u64) -> PageNumber {
    PageNumber::new(((entry & ADDR_MASK) as usize) / PAGE_SIZE)
}

#[inline]
pub const fn entry_flags(entry: u64) -> PageFlags {
    PageFlags::from_bits_truncate(entry)
}

#[inline]
pub const fn make_entry(pn: PageNumber, flags: PageFlags) -> u64 {
    ((pn.as_index() * PAGE_SIZE) as u64 & ADDR_MASK) | flags.bits()
}

/// Index into the table at `level` (0 = top) for `va`.
#[inline]
pub const fn table_index(va: usize, level: usize) -> usize {
    (va >> (12 + 9 * (PT_LEVELS - 1 - level))) & (PT_ENTRIES - 1)
}

/// Bytes spanned by one entry of a table at `level`.
#[inline]
const fn entry_span(level: usize) -> usize {
    PAGE_SIZE << (9 * (PT_LEVELS - 1 - level))
}

/// Looks up the leaf mapping for the page containing `va`.
pub fn lookup(mem: &PhysicalMemory, root: PageNumber, va: usize) -> Option<Mapping> {
    if va >= VA_LIMIT {
        return None;
    }
    let mut table = root;
    let mut flags = PageFlags::all();
    for level in 0..PT_LEVELS {
        let entry = mem.read_entry(table, table_index(va, level));
        let bits = entry_flags(entry);
        if !bits.contains(PageFlags::PRESENT) {
            return None;
        }
        flags &= bits;
        table = entry_page(entry);
    }
    Some(Mapping { pn: table, flags })
}

/// Installs leaf mappings `[va, va + size)` -> `[pa, pa + size)` with `flags`.
///
/// Missing intermediate tables come from `source` (entries `PRESENT|WRITABLE|USER`).
/// The operation is all-or-nothing: on failure every leaf installed and every table
/// allocated by this call is removed again. Leaf targets are not reference counted here.
pub fn map(
    mem: &mut PhysicalMemory,
    root: PageNumber,
    va: usize,
    pa: usize,
    size: usize,
    flags: PageFlags,
    source: &mut impl PageSource,
) -> Result<(), MapError> {
    if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }
    if !flags.contains(PageFlags::PRESENT) {
        return Err(MapError::InvalidFlags);
    }
    let va_end = va.checked_add(size).ok_or(MapError::OutOfRange)?;
    let pa_end = pa.checked_add(size).ok_or(MapError::OutOfRange)?;
    if va_end > VA_LIMIT || pa_end > mem.size() {
        return Err(MapError::OutOfRange);
    }
    if (va..va_end).step_by(PAGE_SIZE).any(|page| lookup(mem, root, page).is_some()) {
        return Err(MapError::Overlap);
    }

    let mut txn = MapTxn::default();
    for offset in (0..size).step_by(PAGE_SIZE) {
        let page = va + offset;
        let leaf = match walk_create(mem, root, page, source, &mut txn) {
            Ok(table) => table,
            Err(err) => {
                txn.rollback(mem);
                return Err(err);
            }
        };
        let index = table_index(page, PT_LEVELS - 1);
        mem.write_entry(leaf, index, make_entry(PageNumber::new((pa + offset) / PAGE_SIZE), flags));
        txn.leaves.push((leaf, index));
    }
    Ok(())
}

/// Clears the leaf entry for `va` and returns what it mapped.
pub fn unmap(mem: &mut PhysicalMemory, root: PageNumber, va: usize) -> Option<Mapping> {
    let mapping = lookup(mem, root, va)?;
    let mut table = root;
    for level in 0..PT_LEVELS - 1 {
        table = entry_page(mem.read_entry(table, table_index(va, level)));
    }
    mem.write_entry(table, table_index(va, PT_LEVELS - 1), 0);
    Some(mapping)
}

/// Collects every present leaf whose address lies in `range`, in address order.
pub fn collect_leaves(mem: &PhysicalMemory, root: PageNumber, range: Range<usize>) -> Vec<Leaf> {
    let mut out = Vec::new();
    collect_level(mem, root, 0, 0, PageFlags::all(), &range, &mut out);
    out
}

fn collect_level(
    mem: &PhysicalMemory,
    table: PageNumber,
    level: usize,
    base: usize,
    inherited: PageFlags,
    range: &Range<usize>,
    out: &mut Vec<Leaf>,
) {
    let span = entry_span(level);
    for index in 0..PT_ENTRIES {
        let start = base + index * span;
        if start >= range.end || start.saturating_add(span) <= range.start {
            continue;
        }
        let entry = mem.read_entry(table, index);
        let flags = entry_flags(entry);
        if !flags.contains(PageFlags::PRESENT) {
            continue;
        }
        let next = entry_page(entry);
        if level == PT_LEVELS - 1 {
            out.push(Leaf { va: start, mapping: Mapping { pn: next, flags: inherited & flags } });
        } else {
            collect_level(mem, next, level + 1, start, inherited & flags, range, out);
        }
    }
}

/// Interior table pages reachable from `root`, root first, with their level.
pub fn collect_tables(mem: &PhysicalMemory, root: PageNumber) -> Vec<(usize, PageNumber)> {
    let mut out = Vec::new();
    collect_tables_level(mem, root, 0, &mut out);
    out
}

fn collect_tables_level(
    mem: &PhysicalMemory,
    table: PageNumber,
    level: usize,
    out: &mut Vec<(usize, PageNumber)>,
) {
    out.push((level, table));
    if level == PT_LEVELS - 1 {
        return;
    }
    for index in 0..PT_ENTRIES {
        let entry = mem.read_entry(table, index);
        if entry_flags(entry).contains(PageFlags::PRESENT) {
            collect_tables_level(mem, entry_page(entry), level + 1, out);
        }
    }
}

/// Walks to the leaf table for `va`, creating missing levels from `source`.
fn walk_create(
    mem: &mut PhysicalMemory,
    root: PageNumber,
    va: usize,
    source: &mut impl PageSource,
    txn: &mut MapTxn,
) -> Result<PageNumber, MapError> {
    let mut table = root;
    for level in 0..PT_LEVELS - 1 {
        let index = table_index(va, level);
        let entry = mem.read_entry(table, index);
        if entry_flags(entry).contains(PageFlags::PRESENT) {
            table = entry_page(entry);
            continue;
        }
        let next = source.table_page(mem)?;
        mem.write_entry(table, index, make_entry(next, PageFlags::TABLE));
        txn.tables.push((table, index, next));
        table = next;
    }
    Ok(table)
}

/// Undo log for one `map` call.
#[derive(Default)]
struct MapTxn {
    leaves: Vec<(PageNumber, usize)>,
    tables: Vec<(PageNumber, usize, PageNumber)>,
}

impl MapTxn {
    fn rollback(self, mem: &mut PhysicalMemory) {
        for (table, index) in self.leaves {
            mem.write_entry(table, index, 0);
        }
        for (parent, index, page) in self.tables.into_iter().rev() {
            mem.write_entry(parent, index, 0);
            mem.release(page);
        }
    }
}
