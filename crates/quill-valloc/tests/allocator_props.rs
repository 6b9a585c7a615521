#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use quill_valloc::{VirtualAllocation, VirtualBlock};

const BLOCK_CAPACITY: u64 = 4096;

#[derive(Debug, Clone)]
enum Op {
    Alloc { size: u64, align_log2: u32 },
    Free { index: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..=512, 0u32..=8).prop_map(|(size, align_log2)| Op::Alloc { size, align_log2 }),
        2 => any::<usize>().prop_map(|index| Op::Free { index }),
    ]
}

fn assert_disjoint_and_bounded(live: &[VirtualAllocation], capacity: u64) {
    let mut ranges: Vec<(u64, u64)> = live.iter().map(|a| (a.offset(), a.end())).collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "overlapping allocations {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
    if let Some(last) = ranges.last() {
        assert!(last.1 <= capacity);
    }
    let total: u64 = live.iter().map(|a| a.size()).sum();
    assert!(total <= capacity);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn virtual_block_never_overlaps_or_overcommits(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut block = VirtualBlock::new(BLOCK_CAPACITY);
        let mut live: Vec<VirtualAllocation> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { size, align_log2 } => {
                    let alignment = 1u64 << align_log2;
                    if let Ok(allocation) = block.allocate(size, alignment) {
                        prop_assert_eq!(allocation.offset() % alignment, 0);
                        prop_assert_eq!(allocation.size(), size);
                        live.push(allocation);
                    }
                }
                Op::Free { index } => {
                    if !live.is_empty() {
                        let allocation = live.swap_remove(index % live.len());
                        prop_assert!(block.free(allocation).is_ok());
                    }
                }
            }

            assert_disjoint_and_bounded(&live, BLOCK_CAPACITY);
            let stats = block.statistics();
            prop_assert_eq!(stats.allocation_count, live.len());
            prop_assert_eq!(stats.allocation_bytes, live.iter().map(|a| a.size()).sum::<u64>());
        }

        for allocation in live.drain(..) {
            prop_assert!(block.free(allocation).is_ok());
        }
        let stats = block.statistics();
        prop_assert_eq!(stats.free_range_count, 1);
        prop_assert_eq!(stats.largest_free_range, BLOCK_CAPACITY);
    }

    #[test]
    fn cleared_blocks_reject_every_earlier_token(sizes in prop::collection::vec(1u64..=256, 1..16)) {
        let mut block = VirtualBlock::new(BLOCK_CAPACITY);
        let stale: Vec<VirtualAllocation> = sizes
            .iter()
            .filter_map(|&size| block.allocate(size, 1).ok())
            .collect();
        block.clear();

        let live: Vec<VirtualAllocation> = sizes
            .iter()
            .filter_map(|&size| block.allocate(size, 1).ok())
            .collect();
        let live_count = live.len();
        for allocation in stale {
            prop_assert!(block.free(allocation).is_err());
        }
        prop_assert_eq!(block.statistics().allocation_count, live_count);
        assert_disjoint_and_bounded(&live, BLOCK_CAPACITY);
    }
}
