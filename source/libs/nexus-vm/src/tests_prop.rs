// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the block allocator
//! OWNERS: @runtime
//! NOTE: Tests only; no allocator logic.
//!
//! TEST_SCENARIOS:
//!   - alloc_free_roundtrip(): freeing everything, paged or not, collapses the list to one Free block
//!   - blocks_never_overlap(): any alloc/page/unpage/free interleaving keeps the list sorted and
//!     contiguous, and every live reservation stays freeable
//!   - exact_fit_keeps_count(): exact fit retypes in place, a smaller request adds one block

use super::{BlockAllocator, BlockState, MapFlags, PagingConfig, VRange, BASE_PAGE_SIZE};
use proptest::prelude::*;

const BASE: usize = 0x4000_0000;
const PAGES: usize = 256;

fn allocator() -> BlockAllocator {
    BlockAllocator::new(&PagingConfig::new().with_window(BASE, PAGES * BASE_PAGE_SIZE)).unwrap()
}

#[derive(Clone, Debug)]
enum Op {
    Alloc(usize),
    Page(usize),
    Unpage(usize),
    Free(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..=8 * BASE_PAGE_SIZE).prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Page),
        any::<usize>().prop_map(Op::Unpage),
        any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn alloc_free_roundtrip(
        sizes in prop::collection::vec(1usize..=16 * BASE_PAGE_SIZE, 1..24),
        paged in any::<u32>(),
        rotate in 0usize..24,
    ) {
        let mut alloc = allocator();
        let mut live: Vec<VRange> = sizes.iter().filter_map(|size| alloc.alloc(*size).ok()).collect();
        for (i, range) in live.iter().enumerate() {
            if paged & (1 << i) != 0 {
                alloc.mark_paged(*range, None, MapFlags::RW).unwrap();
            }
        }
        let len = live.len().max(1);
        live.rotate_left(rotate % len);
        for range in live {
            alloc.free(range).unwrap();
            prop_assert!(alloc.check_invariants().is_ok());
        }
        prop_assert_eq!(alloc.block_count(), 1);
        prop_assert_eq!(alloc.free_bytes(), PAGES * BASE_PAGE_SIZE);
    }

    #[test]
    fn blocks_never_overlap(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut alloc = allocator();
        // (reservation, currently paged)
        let mut live: Vec<(VRange, bool)> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(range) = alloc.alloc(size) {
                        prop_assert!(live
                            .iter()
                            .all(|(r, _)| r.end() <= range.start || range.end() <= r.start));
                        live.push((range, false));
                    }
                }
                Op::Page(pick) if !live.is_empty() => {
                    let i = pick % live.len();
                    let (range, paged) = live[i];
                    if !paged {
                        alloc.mark_paged(range, None, MapFlags::RW).unwrap();
                        live[i].1 = true;
                    }
                }
                Op::Unpage(pick) if !live.is_empty() => {
                    let i = pick % live.len();
                    let (range, paged) = live[i];
                    if paged {
                        alloc.mark_allocated(range).unwrap();
                        live[i].1 = false;
                    }
                }
                Op::Free(pick) if !live.is_empty() => {
                    let (range, _) = live.swap_remove(pick % live.len());
                    alloc.free(range).unwrap();
                }
                Op::Alloc(_) | Op::Page(_) | Op::Unpage(_) | Op::Free(_) => {}
            }
            prop_assert!(alloc.check_invariants().is_ok());
            let blocks: Vec<_> = alloc.blocks().collect();
            prop_assert!(blocks.windows(2).all(|w| w[0].end() == w[1].start));
        }
        for (range, _) in live {
            alloc.free(range).unwrap();
        }
        prop_assert_eq!(alloc.block_count(), 1);
    }

    #[test]
    fn exact_fit_keeps_count(hole in 1usize..=8, smaller in 1usize..8) {
        let mut alloc = allocator();
        let a = alloc.alloc(hole * BASE_PAGE_SIZE).unwrap();
        alloc.alloc(BASE_PAGE_SIZE).unwrap();
        alloc.free(a).unwrap();
        let before = alloc.block_count();

        let exact = alloc.alloc(hole * BASE_PAGE_SIZE).unwrap();
        prop_assert_eq!(exact.start, BASE);
        prop_assert_eq!(alloc.block_count(), before);
        alloc.free(exact).unwrap();

        prop_assume!(smaller < hole);
        alloc.alloc(smaller * BASE_PAGE_SIZE).unwrap();
        prop_assert_eq!(alloc.block_count(), before + 1);
        prop_assert_eq!(alloc.find(BASE + smaller * BASE_PAGE_SIZE).map(|b| b.state), Some(BlockState::Free));
    }
}
