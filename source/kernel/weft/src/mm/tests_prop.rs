// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the page arena and address spaces
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Owner/refcount agreement under arbitrary allocate/retain/release sequences
//!   - All-or-nothing page-table mapping under injected allocation failures
//!   - Duplicate followed by free restores the page arena
//!
//! TEST_SCENARIOS:
//!   - refcount_zero_iff_free(): random operations never break refcount == 0 <=> Free
//!   - map_is_all_or_nothing(): a failed map leaves page info untouched
//!   - duplicate_then_free_restores_memory(): forked address spaces release every page

use alloc::vec::Vec;

use proptest::prelude::*;

use super::page_table::{self, OwnedPages};
use super::verify::{check_virtual_memory, ProcessView};
use super::{AddressSpaceManager, Owner, PageFlags, PhysicalMemory, PAGE_SIZE};
use crate::config::MemoryLayout;
use crate::types::{PageNumber, Pid};

#[derive(Clone, Debug)]
enum Op {
    Allocate(u32),
    Retain(usize),
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..8).prop_map(Op::Allocate),
        any::<usize>().prop_map(Op::Retain),
        any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn refcount_zero_iff_free(ops in proptest::collection::vec(arb_op(), 1..200)) {
        let mut mem = PhysicalMemory::new(&MemoryLayout::new());
        let mut held: Vec<PageNumber> = Vec::new();
        for op in ops {
            match op {
                Op::Allocate(pid) => {
                    if let Ok(pn) = mem.allocate(Owner::Process(Pid::from_raw(pid))) {
                        prop_assert_eq!(mem.refcount(pn), 1);
                        held.push(pn);
                    }
                }
                Op::Retain(pick) if !held.is_empty() => {
                    let pn = held[pick % held.len()];
                    mem.retain(pn);
                    held.push(pn);
                }
                Op::Release(pick) if !held.is_empty() => {
                    let pn = held.swap_remove(pick % held.len());
                    mem.release(pn);
                }
                _ => {}
            }
        }
        prop_assert!(mem.violations().is_empty());
        for info in mem.snapshot() {
            prop_assert_eq!(info.refcount == 0, info.owner == Owner::Free);
        }
        for pn in &held {
            prop_assert_eq!(mem.refcount(*pn) as usize, held.iter().filter(|p| *p == pn).count());
        }
    }

    #[test]
    fn map_is_all_or_nothing(
        first_page in 0usize..2048,
        npages in 1usize..8,
        successes in 0usize..8,
    ) {
        let mut mem = PhysicalMemory::new(&MemoryLayout::new());
        let root = mem.allocate(Owner::Kernel).expect("root");
        let va = 0x100_0000 + first_page * PAGE_SIZE;
        let before = mem.snapshot();
        mem.fail_after(successes);
        let result = page_table::map(&mut mem, root, va, 0x10_0000, npages * PAGE_SIZE, PageFlags::USER_RW, &mut OwnedPages(Owner::Kernel));
        mem.clear_failpoint();
        let mapped = (0..npages).filter(|i| page_table::lookup(&mem, root, va + i * PAGE_SIZE).is_some()).count();
        match result {
            Ok(()) => prop_assert_eq!(mapped, npages),
            Err(_) => {
                prop_assert_eq!(mapped, 0);
                prop_assert_eq!(mem.snapshot(), before);
            }
        }
    }

    #[test]
    fn duplicate_then_free_restores_memory(
        pages in proptest::collection::btree_map(0usize..0x100, any::<bool>(), 0..24),
        fail in proptest::option::of(0usize..32),
    ) {
        let mut mm = AddressSpaceManager::new(MemoryLayout::new()).expect("mm");
        let parent = mm.duplicate(mm.kernel_root(), Pid::from_raw(1)).expect("parent");
        for (&index, &writable) in &pages {
            let flags = if writable { PageFlags::USER_RW } else { PageFlags::USER_RO };
            mm.map_page(parent, 0x10_0000 + index * PAGE_SIZE, Pid::from_raw(1), flags).expect("map");
        }
        let before = mm.memory().snapshot();
        if let Some(successes) = fail {
            mm.memory_mut().fail_after(successes);
        }
        let duplicated = mm.duplicate(parent, Pid::from_raw(2));
        mm.memory_mut().clear_failpoint();
        match duplicated {
            Ok(child) => {
                let views = [
                    ProcessView { pid: Pid::from_raw(1), live: true, root: Some(parent) },
                    ProcessView { pid: Pid::from_raw(2), live: true, root: Some(child) },
                ];
                prop_assert_eq!(check_virtual_memory(&mm, &views), Ok(()));
                mm.free(child);
            }
            Err(_) => prop_assert!(fail.is_some()),
        }
        prop_assert_eq!(mm.memory().snapshot(), before);
        prop_assert!(mm.memory().violations().is_empty());
    }
}
