//! Descriptor heap sub-allocation.
//!
//! The shader-visible CBV/SRV/UAV heap is carved up by an `offset_allocator`
//! [`Allocator`] in units of descriptors. RTV and DSV heaps hand out single
//! slots from a [`VirtualBlock`] that is also sized in descriptors, so the
//! device's descriptor stride never enters the bookkeeping.

use std::fmt;

use offset_allocator::{Allocation, Allocator};
use quill_valloc::{VirtualAllocation, VirtualBlock};

use crate::device::{DescriptorHandle, DescriptorHeapId, DescriptorHeapKind, Device};
use crate::error::AllocError;

/// A contiguous run of descriptors in the shader-visible heap.
pub struct SrvDescriptor {
    allocation: Allocation,
    count: u32,
    handle: DescriptorHandle,
}

impl SrvDescriptor {
    pub fn handle(&self) -> DescriptorHandle {
        self.handle
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

impl fmt::Debug for SrvDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrvDescriptor")
            .field("handle", &self.handle)
            .field("count", &self.count)
            .finish()
    }
}

pub struct SrvDescriptorAllocator {
    heap: DescriptorHeapId,
    capacity: u32,
    allocator: Allocator,
}

impl SrvDescriptorAllocator {
    pub fn new<D: Device>(device: &mut D, count: u32) -> Result<Self, AllocError> {
        let heap = device.create_descriptor_heap(DescriptorHeapKind::CbvSrvUav, count, true)?;
        Ok(Self {
            heap,
            capacity: count,
            // One node per descriptor plus the spare a split needs.
            allocator: Allocator::with_max_allocs(count, count + 1),
        })
    }

    pub fn heap(&self) -> DescriptorHeapId {
        self.heap
    }

    pub fn allocate(&mut self, count: u32) -> Result<SrvDescriptor, AllocError> {
        let allocation = self
            .allocator
            .allocate(count)
            .ok_or(AllocError::OutOfDescriptors {
                heap: DescriptorHeapKind::CbvSrvUav,
                count,
            })?;
        let handle = DescriptorHandle {
            heap: self.heap,
            index: allocation.offset,
        };
        Ok(SrvDescriptor {
            allocation,
            count,
            handle,
        })
    }

    pub fn free(&mut self, descriptor: SrvDescriptor) {
        self.allocator.free(descriptor.allocation);
    }

    pub fn free_count(&self) -> u32 {
        self.allocator.storage_report().total_free_space
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn destroy<D: Device>(&self, device: &mut D) {
        device.destroy_descriptor_heap(self.heap);
    }
}

impl fmt::Debug for SrvDescriptorAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrvDescriptorAllocator")
            .field("heap", &self.heap)
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

/// One RTV or DSV slot.
#[derive(Debug, PartialEq, Eq)]
pub struct ViewDescriptor {
    allocation: VirtualAllocation,
    handle: DescriptorHandle,
}

impl ViewDescriptor {
    pub fn handle(&self) -> DescriptorHandle {
        self.handle
    }
}

#[derive(Debug)]
pub struct ViewDescriptorAllocator {
    kind: DescriptorHeapKind,
    heap: DescriptorHeapId,
    block: VirtualBlock,
}

impl ViewDescriptorAllocator {
    pub fn new<D: Device>(device: &mut D, kind: DescriptorHeapKind, count: u32) -> Result<Self, AllocError> {
        let heap = device.create_descriptor_heap(kind, count, false)?;
        Ok(Self {
            kind,
            heap,
            block: VirtualBlock::new(count as u64),
        })
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn allocate(&mut self) -> Result<ViewDescriptor, AllocError> {
        let allocation = self
            .block
            .allocate(1, 1)
            .map_err(|_| AllocError::OutOfDescriptors {
                heap: self.kind,
                count: 1,
            })?;
        let handle = DescriptorHandle {
            heap: self.heap,
            index: allocation.offset() as u32,
        };
        Ok(ViewDescriptor { allocation, handle })
    }

    pub fn free(&mut self, descriptor: ViewDescriptor) -> Result<(), AllocError> {
        self.block.free(descriptor.allocation)?;
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        self.block.statistics().allocation_count
    }

    pub fn destroy<D: Device>(&self, device: &mut D) {
        device.destroy_descriptor_heap(self.heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftDevice;

    #[test]
    fn srv_heap_hands_out_distinct_slots_until_full() {
        let mut device = SoftDevice::new();
        let mut srv = SrvDescriptorAllocator::new(&mut device, 4).unwrap();

        let slots: Vec<_> = (0..4).map(|_| srv.allocate(1).unwrap()).collect();
        let mut indices: Vec<u32> = slots.iter().map(|s| s.handle().index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        assert_eq!(
            srv.allocate(1).unwrap_err(),
            AllocError::OutOfDescriptors {
                heap: DescriptorHeapKind::CbvSrvUav,
                count: 1
            }
        );

        for slot in slots {
            srv.free(slot);
        }
        assert_eq!(srv.free_count(), 4);
    }

    #[test]
    fn view_heap_indices_are_in_descriptor_units() {
        let mut device = SoftDevice::new();
        let mut rtv = ViewDescriptorAllocator::new(&mut device, DescriptorHeapKind::Rtv, 3).unwrap();

        let a = rtv.allocate().unwrap();
        let b = rtv.allocate().unwrap();
        let c = rtv.allocate().unwrap();
        assert!(rtv.allocate().is_err());

        let mut indices = [a.handle().index, b.handle().index, c.handle().index];
        indices.sort_unstable();
        assert_eq!(indices, [0, 1, 2]);

        let freed_index = b.handle().index;
        rtv.free(b).unwrap();
        assert_eq!(rtv.allocate().unwrap().handle().index, freed_index);
        assert_eq!(rtv.live_count(), 3);
    }

    #[test]
    fn view_heap_fills_every_slot_with_an_odd_descriptor_stride() {
        let mut device = SoftDevice::new();
        device.set_descriptor_increment(DescriptorHeapKind::Rtv, 48);
        let mut rtv = ViewDescriptorAllocator::new(&mut device, DescriptorHeapKind::Rtv, 12).unwrap();

        let views: Vec<_> = (0..12).map(|_| rtv.allocate().unwrap()).collect();
        let mut indices: Vec<u32> = views.iter().map(|v| v.handle().index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());
        assert!(rtv.allocate().is_err());

        for view in views {
            rtv.free(view).unwrap();
        }
        assert_eq!(rtv.live_count(), 0);
    }

    #[test]
    fn srv_runs_report_their_length() {
        let mut device = SoftDevice::new();
        let mut srv = SrvDescriptorAllocator::new(&mut device, 8).unwrap();

        let run = srv.allocate(3).unwrap();
        assert_eq!(run.count(), 3);
        assert_eq!(srv.free_count(), 5);
        srv.free(run);
        assert_eq!(srv.free_count(), 8);
    }
}
