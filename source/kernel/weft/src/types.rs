// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for addresses, page numbers and process ids
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, PhysAddr, PageNumber, VirtAddr
//! DEPENDS_ON: mm::PAGE_SIZE
//! INVARIANTS: Page numbers index the physical page arena; PID 0 is never handed out

use core::fmt;

use crate::mm::PAGE_SIZE;

/// Process identifier (PID), equal to the process-table slot index.
///
/// **Invariant**: PID 0 is reserved; its slot never leaves the Free state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Creates a PID from a raw value (kernel-internal only).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw PID value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into the process table.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Reserved slot 0.
    pub const RESERVED: Self = Self(0);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

impl From<usize> for Pid {
    #[inline]
    fn from(raw: usize) -> Self {
        Self(raw as u32)
    }
}

/// Physical page number: index into the physical page arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageNumber(usize);

impl PageNumber {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0
    }

    /// Returns the physical address of the first byte of this page.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr(self.0 * PAGE_SIZE)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pn{}", self.0)
    }
}

/// Physical address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Physical page containing this address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber(self.0 / PAGE_SIZE)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Canonical x86-64 virtual address (48-bit, sign extended).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.0 % PAGE_SIZE == 0)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

fn is_canonical(va: usize) -> bool {
    let upper = (va as u64) >> 47;
    upper == 0 || upper == u64::MAX >> 47
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_addresses_must_be_canonical() {
        assert!(VirtAddr::new(0x7FFF_FFFF_F000).is_some());
        assert!(VirtAddr::new(0x8000_0000_0000).is_none());
        assert!(VirtAddr::new(0xFFFF_8000_0000_0000).is_some());
        assert_eq!(VirtAddr::page_aligned(0x10_0010), None);
        assert_eq!(VirtAddr::new(0x10_0010).map(VirtAddr::page_offset), Some(0x10));
    }

    #[test]
    fn page_numbers_convert_to_addresses() {
        assert_eq!(PageNumber::new(0x100).addr(), PhysAddr::new(0x10_0000));
        assert_eq!(PhysAddr::new(0x10_0FFF).page_number(), PageNumber::new(0x100));
        assert!(!PhysAddr::new(0x10_0FFF).is_page_aligned());
        assert_eq!(Pid::from(7usize).as_raw(), 7);
    }
}
