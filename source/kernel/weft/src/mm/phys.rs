// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical page arena with per-page owner tags and reference counts
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysicalMemory::{allocate, assign, release, retain}, Owner, PageInfo
//! DEPENDS_ON: config::MemoryLayout
//! INVARIANTS: refcount == 0 <=> owner == Free; failed allocations leave every PageInfo unchanged;
//!             releasing a free page never underflows and is recorded as a violation

extern crate alloc;

use alloc::{vec, vec::Vec};
use core::fmt;

use thiserror::Error;

use super::{PAGE_SIZE, PT_ENTRIES};
use crate::config::MemoryLayout;
use crate::types::{PageNumber, PhysAddr, Pid};

/// Owner tag of a physical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Free,
    /// Hardware reserved (null page, I/O hole).
    Reserved,
    Kernel,
    Process(Pid),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Free => f.write_str("free"),
            Owner::Reserved => f.write_str("reserved"),
            Owner::Kernel => f.write_str("kernel"),
            Owner::Process(pid) => write!(f, "pid {}", pid),
        }
    }
}

/// Bookkeeping for one physical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub owner: Owner,
    pub refcount: u32,
}

impl PageInfo {
    pub const FREE: Self = Self { owner: Owner::Free, refcount: 0 };

    /// Whether the page is in the free pool.
    pub const fn is_free(&self) -> bool {
        self.refcount == 0
    }
}

/// Every page is in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("out of physical memory")]
pub struct AllocError;

/// Rejections reported by [`PhysicalMemory::assign`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AssignError {
    #[error("physical address {0:#x} is not page aligned")]
    Unaligned(usize),
    #[error("physical address {0:#x} is outside physical memory")]
    OutOfRange(usize),
    #[error("physical page at {0:#x} is already allocated")]
    InUse(usize),
    #[error("out of physical memory")]
    Exhausted,
}

/// Simulated physical memory: page metadata plus the backing frames.
pub struct PhysicalMemory {
    info: Vec<PageInfo>,
    frames: Vec<u8>,
    violations: Vec<PageNumber>,
    #[cfg(feature = "failpoints")]
    fail_after: Option<usize>,
}

impl PhysicalMemory {
    /// Creates the arena and tags reserved and kernel pages with refcount 1.
    pub fn new(layout: &MemoryLayout) -> Self {
        let npages = layout.npages();
        let mut info = vec![PageInfo::FREE; npages];
        for (pn, page) in info.iter_mut().enumerate() {
            let addr = pn * PAGE_SIZE;
            let owner = if layout.is_reserved(addr) {
                Owner::Reserved
            } else if layout.is_kernel(addr) {
                Owner::Kernel
            } else {
                Owner::Free
            };
            *page = PageInfo { owner, refcount: u32::from(owner != Owner::Free) };
        }
        Self {
            info,
            frames: vec![0; npages * PAGE_SIZE],
            violations: Vec::new(),
            #[cfg(feature = "failpoints")]
            fail_after: None,
        }
    }

    /// Number of physical pages.
    pub fn npages(&self) -> usize {
        self.info.len()
    }

    /// Total physical memory in bytes.
    pub fn size(&self) -> usize {
        self.info.len() * PAGE_SIZE
    }

    pub fn info(&self, pn: PageNumber) -> Option<PageInfo> {
        self.info.get(pn.as_index()).copied()
    }

    /// Owner of `pn`; out-of-range pages read as free.
    pub fn owner(&self, pn: PageNumber) -> Owner {
        self.info(pn).map_or(Owner::Free, |page| page.owner)
    }

    pub fn refcount(&self, pn: PageNumber) -> u32 {
        self.info(pn).map_or(0, |page| page.refcount)
    }

    /// Copy of the whole metadata array.
    pub fn snapshot(&self) -> Vec<PageInfo> {
        self.info.clone()
    }

    pub fn free_count(&self) -> usize {
        self.info.iter().filter(|page| page.is_free()).count()
    }

    /// Pages whose metadata was misused (release or retain of a free page).
    pub fn violations(&self) -> &[PageNumber] {
        &self.violations
    }

    /// First free page in address order.
    pub fn find_free(&self) -> Option<PageNumber> {
        self.info.iter().position(PageInfo::is_free).map(PageNumber::new)
    }

    /// Allocates the first free page for `owner`, zero-filled, with refcount 1.
    pub fn allocate(&mut self, owner: Owner) -> Result<PageNumber, AllocError> {
        if self.take_failpoint() {
            return Err(AllocError);
        }
        let pn = self.find_free().ok_or(AllocError)?;
        self.claim(pn, owner);
        Ok(pn)
    }

    /// Claims the page at physical address `addr` for `owner`.
    pub fn assign(&mut self, addr: PhysAddr, owner: Owner) -> Result<PageNumber, AssignError> {
        if !addr.is_page_aligned() {
            return Err(AssignError::Unaligned(addr.raw()));
        }
        let pn = addr.page_number();
        match self.info(pn) {
            None => return Err(AssignError::OutOfRange(addr.raw())),
            Some(page) if !page.is_free() => return Err(AssignError::InUse(addr.raw())),
            Some(_) => {}
        }
        if self.take_failpoint() {
            return Err(AssignError::Exhausted);
        }
        self.claim(pn, owner);
        Ok(pn)
    }

    /// Drops one reference; the page returns to the free pool at zero.
    pub fn release(&mut self, pn: PageNumber) {
        let Some(page) = self.info.get_mut(pn.as_index()) else {
            log_error!(target: "mm", "release of out-of-range page {}", pn);
            self.violations.push(pn);
            return;
        };
        if page.refcount == 0 {
            log_error!(target: "mm", "release of free page {}", pn);
            self.violations.push(pn);
            return;
        }
        page.refcount -= 1;
        if page.refcount == 0 {
            page.owner = Owner::Free;
        }
    }

    /// Adds one reference to an allocated page.
    pub fn retain(&mut self, pn: PageNumber) {
        match self.info.get_mut(pn.as_index()) {
            Some(page) if !page.is_free() => page.refcount += 1,
            _ => {
                log_error!(target: "mm", "retain of unallocated page {}", pn);
                self.violations.push(pn);
            }
        }
    }

    /// Re-tags an allocated page; free pages keep their Free tag.
    pub fn set_owner(&mut self, pn: PageNumber, owner: Owner) {
        if let Some(page) = self.info.get_mut(pn.as_index()) {
            if !page.is_free() && owner != Owner::Free {
                page.owner = owner;
            }
        }
    }

    pub fn frame(&self, pn: PageNumber) -> &[u8] {
        let start = pn.as_index() * PAGE_SIZE;
        self.frames.get(start..start + PAGE_SIZE).unwrap_or(&[])
    }

    pub fn frame_mut(&mut self, pn: PageNumber) -> &mut [u8] {
        let start = pn.as_index() * PAGE_SIZE;
        self.frames.get_mut(start..start + PAGE_SIZE).unwrap_or(&mut [])
    }

    /// Copies the full contents of page `src` into page `dst`.
    pub fn copy_frame(&mut self, src: PageNumber, dst: PageNumber) {
        let (src, dst) = (src.as_index(), dst.as_index());
        if src >= self.npages() || dst >= self.npages() || src == dst {
            return;
        }
        self.frames.copy_within(src * PAGE_SIZE..(src + 1) * PAGE_SIZE, dst * PAGE_SIZE);
    }

    /// Reads entry `index` of the table stored in page `table`.
    pub fn read_entry(&self, table: PageNumber, index: usize) -> u64 {
        let Some(bytes) = self.frame(table).get(index * 8..index * 8 + 8) else {
            return 0;
        };
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        u64::from_le_bytes(raw)
    }

    pub fn write_entry(&mut self, table: PageNumber, index: usize, entry: u64) {
        debug_assert!(index < PT_ENTRIES);
        if let Some(bytes) = self.frame_mut(table).get_mut(index * 8..index * 8 + 8) {
            bytes.copy_from_slice(&entry.to_le_bytes());
        }
    }

    fn claim(&mut self, pn: PageNumber, owner: Owner) {
        self.info[pn.as_index()] = PageInfo { owner, refcount: 1 };
        self.frame_mut(pn).fill(0);
    }

    #[cfg(feature = "failpoints")]
    fn take_failpoint(&mut self) -> bool {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                true
            }
            Some(left) => {
                self.fail_after = Some(left - 1);
                false
            }
            None => false,
        }
    }

    #[cfg(not(feature = "failpoints"))]
    #[inline]
    fn take_failpoint(&mut self) -> bool {
        false
    }
}

#[cfg(feature = "failpoints")]
impl PhysicalMemory {
    /// Lets `successes` more page claims succeed, then fails the next one.
    pub fn fail_after(&mut self, successes: usize) {
        self.fail_after = Some(successes);
    }

    /// Disarms a pending failpoint.
    pub fn clear_failpoint(&mut self) {
        self.fail_after = None;
    }
}
