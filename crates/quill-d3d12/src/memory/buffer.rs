use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use quill_valloc::{align_up, is_power_of_two, VirtualAllocation, VirtualBlock, VirtualBlockError};

use crate::config::BufferMemoryConfig;
use crate::device::{BufferId, Device, CONSTANT_BUFFER_PLACEMENT_ALIGNMENT};
use crate::error::{AllocError, DeviceError, OutOfMemoryError};
use crate::stats::RendererStats;

/// One sub-allocation inside an upload buffer owned by [`BufferMemoryManager`].
///
/// Move-only: hand it back to the manager to free it.
#[derive(Debug, PartialEq, Eq)]
pub struct GraphicsAllocation {
    block_index: usize,
    buffer: BufferId,
    allocation: VirtualAllocation,
}

impl GraphicsAllocation {
    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.allocation.offset()
    }

    pub fn size(&self) -> u64 {
        self.allocation.size()
    }
}

/// Vertex and index storage of one compiled geometry.
#[derive(Debug, Default)]
pub struct GeometryBuffers {
    vertex: Option<GraphicsAllocation>,
    index: Option<GraphicsAllocation>,
    vertex_count: u32,
    vertex_stride: u32,
    index_count: u32,
}

impl GeometryBuffers {
    pub fn vertex(&self) -> Option<&GraphicsAllocation> {
        self.vertex.as_ref()
    }

    pub fn index(&self) -> Option<&GraphicsAllocation> {
        self.index.as_ref()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Indices are always 32-bit.
    pub fn index_stride(&self) -> u32 {
        size_of::<u32>() as u32
    }

    pub fn is_allocated(&self) -> bool {
        self.vertex.is_some() || self.index.is_some()
    }
}

/// A per-draw constant buffer slot inside the shared upload buffers.
#[derive(Debug, Default)]
pub struct ConstantBuffer {
    allocation: Option<GraphicsAllocation>,
}

impl ConstantBuffer {
    pub fn allocation(&self) -> Option<&GraphicsAllocation> {
        self.allocation.as_ref()
    }

    /// Buffer and byte offset to bind as a root CBV.
    pub fn gpu_address(&self) -> Option<(BufferId, u64)> {
        self.allocation.as_ref().map(|a| (a.buffer(), a.offset()))
    }
}

#[derive(Debug)]
struct BufferBlock {
    buffer: BufferId,
    block: VirtualBlock,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMemoryStatistics {
    pub block_count: usize,
    pub allocation_count: usize,
    pub allocated_bytes: u64,
    pub capacity_bytes: u64,
    /// Size the next upload buffer will be created with.
    pub allocation_size: u64,
}

/// Sub-allocates vertex, index and constant data from a few large upload buffers.
///
/// Every upload buffer is paired with a [`VirtualBlock`] tracking which byte
/// ranges are live. Requests are served first-fit over the blocks in slot
/// order; when nothing fits, a new buffer is created (larger than the default
/// if a single request needs it). Blocks that become empty are released one
/// at a time after later allocations, but the last block is always kept.
#[derive(Debug)]
pub struct BufferMemoryManager {
    config: BufferMemoryConfig,
    // Slots are tombstoned rather than removed so `GraphicsAllocation::block_index`
    // stays valid for the lifetime of every allocation.
    blocks: Vec<Option<BufferBlock>>,
    allocation_size: u64,
    stats: Arc<RendererStats>,
}

impl BufferMemoryManager {
    /// Creates the first upload buffer.
    pub fn new<D: Device>(
        device: &mut D,
        config: BufferMemoryConfig,
        stats: Arc<RendererStats>,
    ) -> Result<Self, AllocError> {
        if config.allocation_size == 0 {
            return Err(DeviceError::InvalidArgument("buffer allocation size must be > 0".into()).into());
        }
        if !is_power_of_two(config.size_alignment) {
            return Err(VirtualBlockError::InvalidAlignment(config.size_alignment).into());
        }

        let mut manager = Self {
            config,
            blocks: Vec::new(),
            allocation_size: config.allocation_size,
            stats,
        };
        manager.add_block(device)?;
        Ok(manager)
    }

    pub fn config(&self) -> &BufferMemoryConfig {
        &self.config
    }

    /// Allocates `size` bytes aligned to `alignment`, growing the buffer pool
    /// if no existing block can hold the request.
    pub fn alloc<D: Device>(
        &mut self,
        device: &mut D,
        size: u64,
        alignment: u64,
    ) -> Result<GraphicsAllocation, AllocError> {
        let alignment = alignment.max(1);
        if !is_power_of_two(alignment) {
            return Err(VirtualBlockError::InvalidAlignment(alignment).into());
        }
        let size = align_up(size.max(1), alignment);

        let allocation = self.alloc_with_retries(device, size, alignment)?;
        self.try_to_free_available_block(device);
        Ok(allocation)
    }

    fn alloc_with_retries<D: Device>(
        &mut self,
        device: &mut D,
        size: u64,
        alignment: u64,
    ) -> Result<GraphicsAllocation, AllocError> {
        let attempts = self.config.out_of_memory_retry_limit.max(1);

        for attempt in 0..attempts {
            if let Some(allocation) = self.alloc_from_existing_blocks(size, alignment) {
                return Ok(allocation);
            }

            if size > self.allocation_size {
                let grown = size.next_power_of_two().max(self.allocation_size);
                tracing::debug!(
                    requested = size,
                    from = self.allocation_size,
                    to = grown,
                    "growing upload buffer size"
                );
                self.allocation_size = grown;
            }

            if self.block_count() >= self.config.max_blocks {
                tracing::debug!(attempt, blocks = self.block_count(), "upload buffer limit reached");
                continue;
            }
            self.add_block(device)?;
        }

        tracing::error!(requested = size, alignment, attempts, "upload buffers exhausted");
        Err(OutOfMemoryError {
            requested: size,
            alignment,
            attempts,
        }
        .into())
    }

    fn alloc_from_existing_blocks(&mut self, size: u64, alignment: u64) -> Option<GraphicsAllocation> {
        self.blocks
            .iter_mut()
            .enumerate()
            .find_map(|(block_index, slot)| {
                let slot = slot.as_mut()?;
                let allocation = slot.block.allocate(size, alignment).ok()?;
                Some(GraphicsAllocation {
                    block_index,
                    buffer: slot.buffer,
                    allocation,
                })
            })
    }

    fn add_block<D: Device>(&mut self, device: &mut D) -> Result<usize, AllocError> {
        let size = self.allocation_size;
        let buffer = device.create_upload_buffer(size)?;
        let block = BufferBlock {
            buffer,
            block: VirtualBlock::new(size),
        };

        let index = match self.blocks.iter().position(Option::is_none) {
            Some(index) => {
                self.blocks[index] = Some(block);
                index
            }
            None => {
                self.blocks.push(Some(block));
                self.blocks.len() - 1
            }
        };
        self.stats.inc_buffer_blocks_created();
        tracing::debug!(index, size, %buffer, "created upload buffer");
        Ok(index)
    }

    /// Allocates and fills the vertex storage of `geometry`.
    pub fn alloc_vertex<D: Device, T: Pod>(
        &mut self,
        device: &mut D,
        geometry: &mut GeometryBuffers,
        vertices: &[T],
    ) -> Result<(), AllocError> {
        if geometry.vertex.is_some() {
            return Err(AllocError::AlreadyAllocated("vertex buffer"));
        }
        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let allocation = self.alloc(device, bytes.len() as u64, self.config.size_alignment)?;
        self.write(device, &allocation, 0, bytes)?;

        geometry.vertex = Some(allocation);
        geometry.vertex_count = vertices.len() as u32;
        geometry.vertex_stride = size_of::<T>() as u32;
        Ok(())
    }

    /// Allocates and fills the index storage of `geometry`.
    pub fn alloc_index<D: Device>(
        &mut self,
        device: &mut D,
        geometry: &mut GeometryBuffers,
        indices: &[u32],
    ) -> Result<(), AllocError> {
        if geometry.index.is_some() {
            return Err(AllocError::AlreadyAllocated("index buffer"));
        }
        let bytes: &[u8] = bytemuck::cast_slice(indices);
        let allocation = self.alloc(device, bytes.len() as u64, self.config.size_alignment)?;
        self.write(device, &allocation, 0, bytes)?;

        geometry.index = Some(allocation);
        geometry.index_count = indices.len() as u32;
        Ok(())
    }

    /// Reserves `size` bytes (rounded up to 256) for `constant_buffer`.
    pub fn alloc_constant_buffer<D: Device>(
        &mut self,
        device: &mut D,
        constant_buffer: &mut ConstantBuffer,
        size: u64,
    ) -> Result<(), AllocError> {
        if constant_buffer.allocation.is_some() {
            return Err(AllocError::AlreadyAllocated("constant buffer"));
        }
        let allocation = self.alloc(device, size, CONSTANT_BUFFER_PLACEMENT_ALIGNMENT)?;
        constant_buffer.allocation = Some(allocation);
        Ok(())
    }

    pub fn free(&mut self, allocation: GraphicsAllocation) -> Result<(), AllocError> {
        let Some(slot) = self
            .blocks
            .get_mut(allocation.block_index)
            .and_then(Option::as_mut)
        else {
            return Err(VirtualBlockError::UnknownAllocation {
                offset: allocation.offset(),
                size: allocation.size(),
            }
            .into());
        };
        slot.block.free(allocation.allocation)?;
        Ok(())
    }

    pub fn free_constant_buffer(&mut self, constant_buffer: &mut ConstantBuffer) -> Result<(), AllocError> {
        match constant_buffer.allocation.take() {
            Some(allocation) => self.free(allocation),
            None => Ok(()),
        }
    }

    pub fn free_geometry(&mut self, geometry: &mut GeometryBuffers) -> Result<(), AllocError> {
        let vertex = geometry.vertex.take().map(|a| self.free(a));
        let index = geometry.index.take().map(|a| self.free(a));
        geometry.vertex_count = 0;
        geometry.index_count = 0;
        vertex.transpose()?;
        index.transpose()?;
        Ok(())
    }

    /// Writes `bytes` at `offset` within `allocation`.
    pub fn write<D: Device>(
        &self,
        device: &mut D,
        allocation: &GraphicsAllocation,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), AllocError> {
        let end = offset.checked_add(bytes.len() as u64);
        if end.map_or(true, |end| end > allocation.size()) {
            return Err(DeviceError::InvalidArgument(format!(
                "write of {} bytes at {offset} overruns a {}-byte allocation",
                bytes.len(),
                allocation.size()
            ))
            .into());
        }
        device.write_buffer(allocation.buffer(), allocation.offset() + offset, bytes)?;
        Ok(())
    }

    pub fn write_pod<D: Device, T: Pod>(
        &self,
        device: &mut D,
        allocation: &GraphicsAllocation,
        offset: u64,
        value: &T,
    ) -> Result<(), AllocError> {
        self.write(device, allocation, offset, bytemuck::bytes_of(value))
    }

    /// Releases at most one upload buffer whose block has no live allocations.
    /// The last remaining buffer is never released.
    pub fn try_to_free_available_block<D: Device>(&mut self, device: &mut D) -> bool {
        if self.block_count() <= 1 {
            return false;
        }
        let Some(index) = self
            .blocks
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|b| b.block.is_empty()))
        else {
            return false;
        };
        let Some(block) = self.blocks[index].take() else {
            return false;
        };
        device.destroy_buffer(block.buffer);
        self.stats.inc_buffer_blocks_reclaimed();
        tracing::debug!(index, buffer = %block.buffer, "released empty upload buffer");
        true
    }

    /// Destroys every upload buffer. Live allocations are abandoned.
    pub fn shutdown<D: Device>(&mut self, device: &mut D) {
        for block in self.blocks.drain(..).flatten() {
            let live = block.block.statistics().allocation_count;
            if live > 0 {
                tracing::warn!(buffer = %block.buffer, live, "upload buffer destroyed with live allocations");
            }
            device.destroy_buffer(block.buffer);
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.iter().flatten().count()
    }

    pub fn statistics(&self) -> BufferMemoryStatistics {
        let mut stats = BufferMemoryStatistics {
            allocation_size: self.allocation_size,
            ..Default::default()
        };
        for block in self.blocks.iter().flatten() {
            let block_stats = block.block.statistics();
            stats.block_count += 1;
            stats.allocation_count += block_stats.allocation_count;
            stats.allocated_bytes += block_stats.allocation_bytes;
            stats.capacity_bytes += block_stats.block_bytes;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftDevice;

    fn manager(device: &mut SoftDevice, allocation_size: u64) -> BufferMemoryManager {
        let config = BufferMemoryConfig {
            allocation_size,
            ..Default::default()
        };
        BufferMemoryManager::new(device, config, Arc::default()).unwrap()
    }

    #[test]
    fn allocations_are_aligned_and_sized() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 4096);

        let a = buffers.alloc(&mut device, 10, 16).unwrap();
        let b = buffers.alloc(&mut device, 10, 16).unwrap();
        assert_eq!(a.size(), 16);
        assert_eq!(b.offset() % 16, 0);
        assert_ne!(a.offset(), b.offset());
        assert_eq!(buffers.statistics().allocation_count, 2);
    }

    #[test]
    fn exhausting_a_block_adds_a_buffer() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 1024);

        let a = buffers.alloc(&mut device, 600, 16).unwrap();
        let b = buffers.alloc(&mut device, 600, 16).unwrap();
        assert_eq!(a.block_index(), 0);
        assert_eq!(b.block_index(), 1);
        assert_ne!(a.buffer(), b.buffer());
        assert_eq!(device.live_buffer_count(), 2);
    }

    #[test]
    fn oversized_request_grows_the_buffer_size() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 1024);

        let big = buffers.alloc(&mut device, 5000, 16).unwrap();
        assert_eq!(device.buffer_size(big.buffer()), Some(8192));
        assert_eq!(buffers.statistics().allocation_size, 8192);
    }

    #[test]
    fn empty_blocks_are_reclaimed_but_not_the_last_one() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 1024);

        let a = buffers.alloc(&mut device, 600, 16).unwrap();
        let b = buffers.alloc(&mut device, 600, 16).unwrap();
        buffers.free(b).unwrap();

        let c = buffers.alloc(&mut device, 100, 16).unwrap();
        assert_eq!(c.block_index(), 0);
        assert_eq!(buffers.block_count(), 1);
        assert_eq!(device.live_buffer_count(), 1);

        buffers.free(a).unwrap();
        buffers.free(c).unwrap();
        assert!(!buffers.try_to_free_available_block(&mut device));
        assert_eq!(device.live_buffer_count(), 1);
    }

    #[test]
    fn exhaustion_is_an_error_after_bounded_retries() {
        let mut device = SoftDevice::new();
        let config = BufferMemoryConfig {
            allocation_size: 1024,
            max_blocks: 1,
            ..Default::default()
        };
        let mut buffers = BufferMemoryManager::new(&mut device, config, Arc::default()).unwrap();

        let _full = buffers.alloc(&mut device, 1024, 16).unwrap();
        let error = buffers.alloc(&mut device, 16, 16).unwrap_err();
        assert_eq!(
            error,
            AllocError::OutOfMemory(OutOfMemoryError {
                requested: 16,
                alignment: 16,
                attempts: 15,
            })
        );
    }

    #[test]
    fn device_failure_while_growing_is_propagated() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 1024);
        let _first = buffers.alloc(&mut device, 1024, 16).unwrap();

        device.fail_next_creations(1);
        let error = buffers.alloc(&mut device, 16, 16).unwrap_err();
        assert!(matches!(error, AllocError::Device(DeviceError::OutOfDeviceMemory { .. })));
    }

    #[test]
    fn vertex_data_is_written_and_double_allocation_rejected() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 4096);
        let mut geometry = GeometryBuffers::default();

        buffers
            .alloc_vertex(&mut device, &mut geometry, &[1.0f32, 2.0, 3.0])
            .unwrap();
        buffers.alloc_index(&mut device, &mut geometry, &[0, 1, 2]).unwrap();
        assert_eq!(geometry.vertex_count(), 3);
        assert_eq!(geometry.vertex_stride(), 4);
        assert_eq!(geometry.index_count(), 3);

        let vertex = geometry.vertex().unwrap();
        let contents = device.buffer_contents(vertex.buffer()).unwrap();
        let start = vertex.offset() as usize;
        assert_eq!(
            &contents[start..start + 12],
            bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0, 3.0])
        );

        let error = buffers
            .alloc_vertex(&mut device, &mut geometry, &[0.0f32])
            .unwrap_err();
        assert_eq!(error, AllocError::AlreadyAllocated("vertex buffer"));

        buffers.free_geometry(&mut geometry).unwrap();
        assert!(!geometry.is_allocated());
        assert_eq!(buffers.statistics().allocation_count, 0);
    }

    #[test]
    fn constant_buffers_use_256_byte_placement() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 4096);
        let _pad = buffers.alloc(&mut device, 16, 16).unwrap();

        let mut constant_buffer = ConstantBuffer::default();
        buffers
            .alloc_constant_buffer(&mut device, &mut constant_buffer, 100)
            .unwrap();
        let (_, offset) = constant_buffer.gpu_address().unwrap();
        assert_eq!(offset % 256, 0);
        assert_eq!(constant_buffer.allocation().unwrap().size(), 256);

        buffers.free_constant_buffer(&mut constant_buffer).unwrap();
        assert!(constant_buffer.gpu_address().is_none());
    }

    #[test]
    fn writes_outside_the_allocation_are_rejected() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 4096);
        let allocation = buffers.alloc(&mut device, 16, 16).unwrap();
        assert!(buffers.write(&mut device, &allocation, 8, &[0; 9]).is_err());
        assert!(buffers.write(&mut device, &allocation, 8, &[0; 8]).is_ok());
    }

    #[test]
    fn shutdown_destroys_every_buffer() {
        let mut device = SoftDevice::new();
        let mut buffers = manager(&mut device, 1024);
        let _a = buffers.alloc(&mut device, 1000, 16).unwrap();
        let _b = buffers.alloc(&mut device, 1000, 16).unwrap();
        buffers.shutdown(&mut device);
        assert_eq!(device.live_buffer_count(), 0);
    }
}
