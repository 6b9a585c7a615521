#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;

use proptest::prelude::*;
use quill_d3d12::memory::{BufferMemoryManager, GraphicsAllocation};
use quill_d3d12::soft::SoftDevice;
use quill_d3d12::BufferMemoryConfig;

const BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Alloc { size: u64, align_log2: u32 },
    Free { index: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..=96 * 1024, 0u32..=8).prop_map(|(size, align_log2)| Op::Alloc { size, align_log2 }),
        2 => any::<usize>().prop_map(|index| Op::Free { index }),
    ]
}

fn manager(device: &mut SoftDevice) -> BufferMemoryManager {
    let config = BufferMemoryConfig {
        allocation_size: BLOCK_SIZE,
        ..BufferMemoryConfig::default()
    };
    BufferMemoryManager::new(device, config, Arc::default()).unwrap()
}

fn assert_disjoint_within_buffers(device: &SoftDevice, live: &[GraphicsAllocation]) {
    let mut ranges: Vec<_> = live
        .iter()
        .map(|a| (a.buffer(), a.offset(), a.offset() + a.size()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[0].0 == pair[1].0 {
            assert!(pair[0].2 <= pair[1].1, "overlap {:?} {:?}", pair[0], pair[1]);
        }
    }
    for (buffer, _, end) in ranges {
        let size = device.buffer_size(buffer).expect("allocation outlived its upload buffer");
        assert!(end <= size, "{buffer} is {size} bytes, allocation ends at {end}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn buffer_allocations_stay_aligned_disjoint_and_counted(ops in prop::collection::vec(op_strategy(), 1..48)) {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device);
        let mut live: Vec<GraphicsAllocation> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { size, align_log2 } => {
                    let alignment = 1u64 << align_log2;
                    let allocation = buffers.alloc(&mut device, size, alignment).unwrap();
                    prop_assert_eq!(allocation.offset() % alignment, 0);
                    prop_assert!(allocation.size() >= size);
                    prop_assert!(buffers.write(&mut device, &allocation, 0, &[0xab; 4][..size.min(4) as usize]).is_ok());
                    prop_assert!(buffers.write(&mut device, &allocation, allocation.size(), &[0]).is_err());
                    live.push(allocation);
                }
                Op::Free { index } => {
                    if !live.is_empty() {
                        let allocation = live.swap_remove(index % live.len());
                        prop_assert!(buffers.free(allocation).is_ok());
                    }
                }
            }

            assert_disjoint_within_buffers(&device, &live);
            let stats = buffers.statistics();
            prop_assert_eq!(stats.allocation_count, live.len());
            prop_assert_eq!(stats.allocated_bytes, live.iter().map(GraphicsAllocation::size).sum::<u64>());
            prop_assert_eq!(stats.block_count, device.live_buffer_count());
            prop_assert!(stats.block_count >= 1);
        }

        for allocation in live.drain(..) {
            prop_assert!(buffers.free(allocation).is_ok());
        }
        while buffers.try_to_free_available_block(&mut device) {}
        prop_assert_eq!(buffers.block_count(), 1);
        prop_assert_eq!(device.live_buffer_count(), 1);
        prop_assert_eq!(buffers.statistics().allocated_bytes, 0);

        buffers.shutdown(&mut device);
        prop_assert_eq!(device.live_buffer_count(), 0);
        prop_assert!(device.debug_messages().is_empty());
    }
}
