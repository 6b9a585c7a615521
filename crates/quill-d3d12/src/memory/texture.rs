use std::sync::Arc;
use std::time::Duration;

use quill_valloc::{align_up, VirtualAllocation, VirtualBlock};

use crate::config::TextureMemoryConfig;
use crate::device::{
    copyable_footprint, BufferId, ClearValue, Command, CommandAllocatorId, CommandListId,
    DescriptorHandle, DescriptorHeapId, DescriptorHeapKind, Device, FenceId, HeapId, PlacedFootprint,
    QueueId, QueueKind, ResourceState, TextureDesc, TextureFormat, TextureId, TextureUsage,
    DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT, SMALL_RESOURCE_MAX_BYTES,
    SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
};
use crate::error::{AllocError, DeviceError};
use crate::layers::{FramebufferData, SharedDepthStencil};
use crate::memory::descriptor::{
    SrvDescriptor, SrvDescriptorAllocator, ViewDescriptor, ViewDescriptorAllocator,
};
use crate::stats::RendererStats;

/// Total bytes of a mip chain whose most detailed level is `base_memory`
/// bytes: every level is a quarter of the previous one, down to one byte.
pub fn total_memory_for_mip_chain(base_memory: u64, mip_levels: u32) -> u64 {
    let mut total = 0;
    let mut level = base_memory;
    for _ in 0..mip_levels.max(1) {
        total += level;
        if level <= 1 {
            break;
        }
        level /= 4;
    }
    total
}

/// The GPU resource behind a [`GpuTexture`].
#[derive(Debug, PartialEq, Eq)]
pub enum TextureResource {
    /// Carved out of one of the manager's heaps.
    Placed {
        texture: TextureId,
        heap_index: usize,
        allocation: VirtualAllocation,
    },
    /// Owns its own allocation.
    Committed { texture: TextureId },
}

impl TextureResource {
    pub fn texture(&self) -> TextureId {
        match self {
            TextureResource::Placed { texture, .. } | TextureResource::Committed { texture } => *texture,
        }
    }

    pub fn is_placed(&self) -> bool {
        matches!(self, TextureResource::Placed { .. })
    }
}

/// A sampled texture: its resource plus the SRV that exposes it to shaders.
///
/// Must be released with [`TextureMemoryManager::free_texture`]; dropping a
/// live texture leaks its GPU memory and is reported.
#[derive(Debug)]
pub struct GpuTexture {
    resource: Option<TextureResource>,
    srv: Option<SrvDescriptor>,
    desc: TextureDesc,
}

impl GpuTexture {
    pub fn texture_id(&self) -> Option<TextureId> {
        self.resource.as_ref().map(TextureResource::texture)
    }

    pub fn resource(&self) -> Option<&TextureResource> {
        self.resource.as_ref()
    }

    pub fn srv(&self) -> Option<DescriptorHandle> {
        self.srv.as_ref().map(SrvDescriptor::handle)
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    pub fn is_placed(&self) -> bool {
        self.resource.as_ref().is_some_and(TextureResource::is_placed)
    }

    pub fn is_released(&self) -> bool {
        self.resource.is_none()
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        if let Some(resource) = &self.resource {
            tracing::error!(
                texture = %resource.texture(),
                "texture dropped without being released; its GPU memory is leaked"
            );
        }
    }
}

#[derive(Debug)]
struct PlacedHeap {
    heap: HeapId,
    block: VirtualBlock,
}

/// Resources of an upload whose copy may still be running.
#[derive(Debug)]
struct StrandedUpload {
    fence_value: u64,
    /// `false` when the signal after the copy could not be queued.
    signaled: bool,
    staging: BufferId,
    textures: Vec<GpuTexture>,
}

/// Dedicated copy queue used for synchronous texture uploads.
#[derive(Debug)]
struct UploadQueue {
    queue: QueueId,
    allocator: CommandAllocatorId,
    list: CommandListId,
    fence: FenceId,
    fence_value: u64,
    stranded: Option<StrandedUpload>,
}

impl UploadQueue {
    fn new<D: Device>(device: &mut D) -> Result<Self, DeviceError> {
        Ok(Self {
            queue: device.create_command_queue(QueueKind::Copy)?,
            allocator: device.create_command_allocator(QueueKind::Copy)?,
            list: device.create_command_list(QueueKind::Copy)?,
            fence: device.create_fence(0)?,
            fence_value: 0,
            stranded: None,
        })
    }

    fn destroy<D: Device>(&self, device: &mut D) {
        device.destroy_command_list(self.list);
        device.destroy_command_allocator(self.allocator);
        device.destroy_fence(self.fence);
        device.destroy_command_queue(self.queue);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureMemoryStatistics {
    pub heap_count: usize,
    pub placed_allocation_count: usize,
    pub placed_bytes: u64,
    pub free_srv_descriptors: u32,
    pub live_rtv_descriptors: usize,
    pub live_dsv_descriptors: usize,
}

/// Creates textures and framebuffers and owns their descriptor heaps.
///
/// Small textures are placed resources sub-allocated from shared heaps;
/// large ones and every render target are committed resources.
#[derive(Debug)]
pub struct TextureMemoryManager {
    config: TextureMemoryConfig,
    heaps: Vec<Option<PlacedHeap>>,
    srv: SrvDescriptorAllocator,
    rtv: ViewDescriptorAllocator,
    dsv: ViewDescriptorAllocator,
    upload: UploadQueue,
    fence_timeout: Duration,
    stats: Arc<RendererStats>,
}

impl TextureMemoryManager {
    pub fn new<D: Device>(
        device: &mut D,
        config: TextureMemoryConfig,
        fence_timeout: Duration,
        stats: Arc<RendererStats>,
    ) -> Result<Self, AllocError> {
        if config.heap_size == 0 || config.placed_heap_divisor == 0 {
            return Err(DeviceError::InvalidArgument(
                "texture heap size and divisor must be > 0".into(),
            )
            .into());
        }
        Ok(Self {
            config,
            heaps: Vec::new(),
            srv: SrvDescriptorAllocator::new(device, config.srv_descriptor_count)?,
            rtv: ViewDescriptorAllocator::new(device, DescriptorHeapKind::Rtv, config.rtv_descriptor_count)?,
            dsv: ViewDescriptorAllocator::new(device, DescriptorHeapKind::Dsv, config.dsv_descriptor_count)?,
            upload: UploadQueue::new(device)?,
            fence_timeout,
            stats,
        })
    }

    pub fn config(&self) -> &TextureMemoryConfig {
        &self.config
    }

    /// Shader-visible heap every SRV lives in.
    pub fn srv_heap(&self) -> DescriptorHeapId {
        self.srv.heap()
    }

    /// Whether a texture of `total_memory` bytes (mip chain included) is placed.
    pub fn can_be_placed_resource(&self, total_memory: u64) -> bool {
        total_memory <= self.config.size_limit_for_being_placed()
    }

    /// Creates a sampled texture and uploads `pixels` (tightly packed first mip).
    pub fn alloc_texture<D: Device>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> Result<GpuTexture, AllocError> {
        let expected = desc.base_memory() as usize;
        if pixels.len() != expected {
            return Err(AllocError::PixelDataSize {
                expected,
                actual: pixels.len(),
            });
        }

        let texture = self.alloc_uninitialized_texture(device, desc, ResourceState::CopyDest)?;
        let Some(resource) = texture.resource.as_ref() else {
            return Err(AllocError::AlreadyAllocated("texture"));
        };
        if let Err(err) = self.upload(device, resource, desc, pixels) {
            let mut texture = texture;
            match self.upload.stranded.as_mut() {
                // The copy may still be writing into it.
                Some(stranded) => stranded.textures.push(texture),
                None => self.free_texture(device, &mut texture),
            }
            return Err(err);
        }
        Ok(texture)
    }

    /// Creates a sampled texture without uploading anything to it.
    ///
    /// Placed textures still need an aliasing barrier before their first use.
    pub fn alloc_uninitialized_texture<D: Device>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
        initial_state: ResourceState,
    ) -> Result<GpuTexture, AllocError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "zero-sized texture {}x{}",
                desc.width, desc.height
            ))
            .into());
        }

        let total_memory = total_memory_for_mip_chain(desc.base_memory(), desc.mip_levels);
        let resource = if self.can_be_placed_resource(total_memory) {
            self.alloc_as_placed(device, desc, initial_state)?
        } else {
            self.alloc_as_committed(device, desc, initial_state, None)?
        };

        let mut texture = GpuTexture {
            resource: Some(resource),
            srv: None,
            desc: *desc,
        };
        let srv = match self.srv.allocate(1) {
            Ok(srv) => srv,
            Err(err) => {
                self.free_texture(device, &mut texture);
                return Err(err);
            }
        };
        let srv_handle = srv.handle();
        texture.srv = Some(srv);
        if let Some(id) = texture.texture_id() {
            if let Err(err) = device.create_shader_resource_view(id, srv_handle) {
                self.free_texture(device, &mut texture);
                return Err(err.into());
            }
        }
        Ok(texture)
    }

    pub fn alloc_as_placed<D: Device>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
        initial_state: ResourceState,
    ) -> Result<TextureResource, AllocError> {
        let requested = if desc.base_memory() <= SMALL_RESOURCE_MAX_BYTES {
            SMALL_RESOURCE_PLACEMENT_ALIGNMENT
        } else {
            DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT
        };
        // The device reports a larger alignment when it cannot honour the small one.
        let info = device.resource_allocation_info(desc, requested);

        let (heap_index, allocation) = self.alloc_heap_range(device, info.size, info.alignment)?;
        let heap = self.heaps[heap_index]
            .as_ref()
            .map(|h| h.heap)
            .ok_or(AllocError::AlreadyAllocated("placed heap"))?;

        match device.create_placed_texture(heap, allocation.offset(), desc, initial_state) {
            Ok(texture) => {
                self.stats.inc_placed_textures();
                tracing::trace!(%texture, heap_index, offset = allocation.offset(), size = info.size, "placed texture");
                Ok(TextureResource::Placed {
                    texture,
                    heap_index,
                    allocation,
                })
            }
            Err(err) => {
                if let Some(h) = self.heaps[heap_index].as_mut() {
                    h.block.free(allocation)?;
                }
                Err(err.into())
            }
        }
    }

    /// First heap (in creation order) with room, or a new heap.
    fn alloc_heap_range<D: Device>(
        &mut self,
        device: &mut D,
        size: u64,
        alignment: u64,
    ) -> Result<(usize, VirtualAllocation), AllocError> {
        for (index, slot) in self.heaps.iter_mut().enumerate() {
            if let Some(heap) = slot {
                if let Ok(allocation) = heap.block.allocate(size, alignment) {
                    return Ok((index, allocation));
                }
            }
        }

        let heap_size = self
            .config
            .heap_size
            .max(align_up(size, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT));
        let heap = device.create_heap(heap_size)?;
        let mut placed = PlacedHeap {
            heap,
            block: VirtualBlock::new(heap_size),
        };
        let allocation = placed.block.allocate(size, alignment)?;
        self.heaps.push(Some(placed));
        tracing::debug!(%heap, heap_size, "created texture heap");
        Ok((self.heaps.len() - 1, allocation))
    }

    pub fn alloc_as_committed<D: Device>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
        initial_state: ResourceState,
        optimized_clear: Option<ClearValue>,
    ) -> Result<TextureResource, AllocError> {
        let texture = device.create_committed_texture(desc, initial_state, optimized_clear)?;
        self.stats.inc_committed_textures();
        tracing::trace!(%texture, width = desc.width, height = desc.height, "committed texture");
        Ok(TextureResource::Committed { texture })
    }

    /// Creates a committed colour target with an RTV and an SRV.
    pub fn alloc_render_target<D: Device>(
        &mut self,
        device: &mut D,
        width: u32,
        height: u32,
        sample_count: u32,
        layer_id: u32,
        depth_stencil: Option<SharedDepthStencil>,
    ) -> Result<FramebufferData, AllocError> {
        let desc = TextureDesc::texture_2d(width, height, TextureFormat::Rgba8Unorm)
            .with_sample_count(sample_count)
            .with_usage(
                TextureUsage::RENDER_TARGET
                    | TextureUsage::SHADER_RESOURCE
                    | TextureUsage::COPY_SRC
                    | TextureUsage::COPY_DST,
            );
        let resource = self.alloc_as_committed(
            device,
            &desc,
            ResourceState::RenderTarget,
            Some(ClearValue::Color([0.0; 4])),
        )?;
        let texture = resource.texture();

        let mut framebuffer = FramebufferData::new(texture, desc, layer_id, ResourceState::RenderTarget, depth_stencil);
        let result = (|| {
            let rtv = self.rtv.allocate()?;
            let rtv_handle = rtv.handle();
            framebuffer.set_view(rtv);
            device.create_render_target_view(texture, rtv_handle)?;

            let srv = self.srv.allocate(1)?;
            let srv_handle = srv.handle();
            framebuffer.set_srv(srv);
            device.create_shader_resource_view(texture, srv_handle)?;
            Ok::<(), AllocError>(())
        })();
        if let Err(err) = result {
            self.free_framebuffer(device, &mut framebuffer);
            return Err(err);
        }
        Ok(framebuffer)
    }

    /// Creates a committed depth-stencil target with a DSV.
    pub fn alloc_depth_stencil<D: Device>(
        &mut self,
        device: &mut D,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> Result<FramebufferData, AllocError> {
        let desc = TextureDesc::texture_2d(width, height, TextureFormat::D24UnormS8Uint)
            .with_sample_count(sample_count)
            .with_usage(TextureUsage::DEPTH_STENCIL);
        let resource = self.alloc_as_committed(
            device,
            &desc,
            ResourceState::DepthWrite,
            Some(ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }),
        )?;
        let texture = resource.texture();

        let mut framebuffer = FramebufferData::new(texture, desc, 0, ResourceState::DepthWrite, None);
        let result = self.dsv.allocate().and_then(|dsv| {
            let handle = dsv.handle();
            framebuffer.set_view(dsv);
            device.create_depth_stencil_view(texture, handle).map_err(AllocError::from)
        });
        if let Err(err) = result {
            self.free_framebuffer(device, &mut framebuffer);
            return Err(err);
        }
        Ok(framebuffer)
    }

    /// RTV for a texture the manager does not own (swapchain back buffers).
    pub fn alloc_external_rtv<D: Device>(
        &mut self,
        device: &mut D,
        texture: TextureId,
    ) -> Result<ViewDescriptor, AllocError> {
        let rtv = self.rtv.allocate()?;
        if let Err(err) = device.create_render_target_view(texture, rtv.handle()) {
            self.rtv.free(rtv)?;
            return Err(err.into());
        }
        Ok(rtv)
    }

    pub fn free_external_rtv(&mut self, rtv: ViewDescriptor) -> Result<(), AllocError> {
        self.rtv.free(rtv)
    }

    /// Copies `pixels` into `resource` through a staging buffer on the copy
    /// queue and blocks until the copy has completed.
    ///
    /// When the wait times out the copy queue is drained before the staging
    /// buffer goes away. If even that fails the staging buffer is kept until a
    /// later upload or [`TextureMemoryManager::shutdown`] sees the copy finish.
    pub fn upload<D: Device>(
        &mut self,
        device: &mut D,
        resource: &TextureResource,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> Result<(), AllocError> {
        self.settle_stranded_upload(device, self.fence_timeout)?;

        let footprint = copyable_footprint(desc);
        let staging = device.create_upload_buffer(footprint.total_bytes)?;

        let row = footprint.row_size as usize;
        let written = pixels
            .chunks_exact(row.max(1))
            .take(desc.height as usize)
            .enumerate()
            .try_for_each(|(y, src)| device.write_buffer(staging, footprint.row_pitch * y as u64, src));
        let submitted = written
            .map_err(AllocError::from)
            .and_then(|()| self.record_upload(device, staging, resource, footprint))
            .and_then(|()| {
                device
                    .execute_command_list(self.upload.queue, self.upload.list)
                    .map_err(AllocError::from)
            });
        if let Err(err) = submitted {
            device.destroy_buffer(staging);
            return Err(err);
        }

        // From here on the copy is queued and owns `staging` until it retires.
        let (queue, fence) = (self.upload.queue, self.upload.fence);
        self.upload.fence_value += 1;
        let fence_value = self.upload.fence_value;
        let waited = match device.signal(queue, fence, fence_value) {
            Ok(()) => device
                .wait_for_fence(fence, fence_value, self.fence_timeout)
                .map_err(|err| (true, err)),
            Err(err) => Err((false, err)),
        };
        let Err((signaled, err)) = waited else {
            device.destroy_buffer(staging);
            self.stats.inc_texture_uploads();
            return Ok(());
        };

        tracing::warn!(%err, fence_value, "texture upload did not complete; draining the copy queue");
        self.upload.stranded = Some(StrandedUpload {
            fence_value,
            signaled,
            staging,
            textures: Vec::new(),
        });
        if let Err(drain_err) = self.settle_stranded_upload(device, Duration::MAX) {
            tracing::error!(%drain_err, fence_value, "copy queue did not drain; keeping the upload's resources alive");
        }
        Err(err.into())
    }

    fn record_upload<D: Device>(
        &mut self,
        device: &mut D,
        staging: BufferId,
        resource: &TextureResource,
        footprint: PlacedFootprint,
    ) -> Result<(), AllocError> {
        let upload = &mut self.upload;
        device.reset_command_allocator(upload.allocator)?;
        device.reset_command_list(upload.list, upload.allocator)?;

        let texture = resource.texture();
        let mut commands = Vec::with_capacity(2);
        if resource.is_placed() {
            commands.push(Command::AliasingBarrier {
                before: None,
                after: texture,
            });
        }
        commands.push(Command::CopyBufferToTexture {
            src: staging,
            footprint,
            dst: texture,
        });
        let recorded = commands
            .into_iter()
            .try_for_each(|command| device.record(upload.list, command));
        let closed = device.close_command_list(upload.list);
        recorded?;
        closed?;
        Ok(())
    }

    /// Waits for a previously stranded upload and releases what it held.
    ///
    /// Leaves the upload stranded and fails when the copy still has not
    /// finished, since the copy allocator cannot be reset until it has.
    fn settle_stranded_upload<D: Device>(&mut self, device: &mut D, timeout: Duration) -> Result<(), AllocError> {
        let Some(stranded) = self.upload.stranded.as_mut() else {
            return Ok(());
        };
        if !stranded.signaled {
            device.signal(self.upload.queue, self.upload.fence, stranded.fence_value)?;
            stranded.signaled = true;
        }
        device.wait_for_fence(self.upload.fence, stranded.fence_value, timeout)?;

        if let Some(stranded) = self.upload.stranded.take() {
            device.destroy_buffer(stranded.staging);
            for mut texture in stranded.textures {
                self.free_texture(device, &mut texture);
            }
        }
        Ok(())
    }

    /// Releases the resource and SRV of `texture`. Calling it twice is a no-op.
    pub fn free_texture<D: Device>(&mut self, device: &mut D, texture: &mut GpuTexture) {
        if let Some(resource) = texture.resource.take() {
            self.free_resource(device, resource);
        }
        if let Some(srv) = texture.srv.take() {
            self.srv.free(srv);
        }
    }

    fn free_resource<D: Device>(&mut self, device: &mut D, resource: TextureResource) {
        match resource {
            TextureResource::Placed {
                texture,
                heap_index,
                allocation,
            } => {
                device.destroy_texture(texture);
                match self.heaps.get_mut(heap_index).and_then(Option::as_mut) {
                    Some(heap) => {
                        if let Err(err) = heap.block.free(allocation) {
                            tracing::error!(%texture, heap_index, %err, "freeing placed texture range failed");
                        }
                    }
                    None => tracing::error!(%texture, heap_index, "placed texture outlived its heap"),
                }
            }
            TextureResource::Committed { texture } => device.destroy_texture(texture),
        }
    }

    /// Releases the texture and every descriptor of `framebuffer`.
    pub fn free_framebuffer<D: Device>(&mut self, device: &mut D, framebuffer: &mut FramebufferData) {
        if let Some(texture) = framebuffer.take_texture() {
            device.destroy_texture(texture);
        }
        if let Some(srv) = framebuffer.take_srv() {
            self.srv.free(srv);
        }
        if let Some(view) = framebuffer.take_view() {
            let allocator = if framebuffer.is_depth_stencil() {
                &mut self.dsv
            } else {
                &mut self.rtv
            };
            if let Err(err) = allocator.free(view) {
                tracing::error!(%err, "freeing framebuffer view failed");
            }
        }
    }

    /// Destroys heaps, descriptor heaps and the upload queue.
    pub fn shutdown<D: Device>(&mut self, device: &mut D) {
        if let Err(err) = self.settle_stranded_upload(device, self.fence_timeout) {
            tracing::error!(%err, "texture upload still running at shutdown; its resources are leaked");
        }
        for heap in self.heaps.drain(..).flatten() {
            let live = heap.block.statistics().allocation_count;
            if live > 0 {
                tracing::warn!(heap = %heap.heap, live, "texture heap destroyed with live placed textures");
            }
            device.destroy_heap(heap.heap);
        }
        self.srv.destroy(device);
        self.rtv.destroy(device);
        self.dsv.destroy(device);
        self.upload.destroy(device);
    }

    pub fn statistics(&self) -> TextureMemoryStatistics {
        let mut stats = TextureMemoryStatistics {
            free_srv_descriptors: self.srv.free_count(),
            live_rtv_descriptors: self.rtv.live_count(),
            live_dsv_descriptors: self.dsv.live_count(),
            ..Default::default()
        };
        for heap in self.heaps.iter().flatten() {
            let block = heap.block.statistics();
            stats.heap_count += 1;
            stats.placed_allocation_count += block.allocation_count;
            stats.placed_bytes += block.allocation_bytes;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftDevice;
    use pretty_assertions::assert_eq;

    fn manager(device: &mut SoftDevice) -> TextureMemoryManager {
        TextureMemoryManager::new(
            device,
            TextureMemoryConfig::default(),
            Duration::from_secs(1),
            Arc::default(),
        )
        .unwrap()
    }

    fn rgba(width: u32, height: u32) -> Vec<u8> {
        (0..width * height * 4).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn mip_chain_sum_stops_at_one_byte() {
        assert_eq!(total_memory_for_mip_chain(1024, 1), 1024);
        assert_eq!(total_memory_for_mip_chain(1024, 3), 1024 + 256 + 64);
        assert_eq!(total_memory_for_mip_chain(16, 10), 16 + 4 + 1);
    }

    #[test]
    fn placed_threshold_is_inclusive() {
        let mut device = SoftDevice::new();
        let textures = manager(&mut device);
        let limit = crate::config::TEXTURE_HEAP_SIZE / 4;
        assert!(textures.can_be_placed_resource(limit));
        assert!(!textures.can_be_placed_resource(limit + 1));
    }

    #[test]
    fn small_textures_are_placed_and_large_ones_committed() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);

        let desc = TextureDesc::texture_2d(512, 512, TextureFormat::Rgba8Unorm);
        let mut placed = textures.alloc_texture(&mut device, &desc, &rgba(512, 512)).unwrap();
        assert!(placed.is_placed());

        let desc = TextureDesc::texture_2d(512, 513, TextureFormat::Rgba8Unorm);
        let mut committed = textures.alloc_texture(&mut device, &desc, &rgba(512, 513)).unwrap();
        assert!(!committed.is_placed());
        assert_eq!(device.texture_placement(committed.texture_id().unwrap()), None);

        textures.free_texture(&mut device, &mut placed);
        textures.free_texture(&mut device, &mut committed);
        assert!(device.debug_messages().is_empty(), "{:?}", device.debug_messages());
    }

    #[test]
    fn upload_round_trips_pixels() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);
        let pixels = rgba(7, 5);
        let desc = TextureDesc::texture_2d(7, 5, TextureFormat::Rgba8Unorm);

        let mut texture = textures.alloc_texture(&mut device, &desc, &pixels).unwrap();
        let id = texture.texture_id().unwrap();
        assert_eq!(device.read_texture(id).unwrap(), pixels);
        assert_eq!(device.texture_state(id), Some(ResourceState::Common));

        textures.free_texture(&mut device, &mut texture);
        assert!(texture.is_released());
        assert_eq!(device.live_texture_count(), 0);
        assert!(device.debug_messages().is_empty(), "{:?}", device.debug_messages());
    }

    #[test]
    fn placed_textures_share_a_heap_without_overlap() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);
        let desc = TextureDesc::texture_2d(32, 32, TextureFormat::Rgba8Unorm);

        let mut all: Vec<GpuTexture> = (0..8)
            .map(|_| textures.alloc_texture(&mut device, &desc, &rgba(32, 32)).unwrap())
            .collect();
        assert_eq!(device.live_heap_count(), 1);

        let mut offsets: Vec<u64> = all
            .iter()
            .map(|t| device.texture_placement(t.texture_id().unwrap()).unwrap().1)
            .collect();
        offsets.sort_unstable();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= SMALL_RESOURCE_PLACEMENT_ALIGNMENT);
        }

        for texture in &mut all {
            textures.free_texture(&mut device, texture);
        }
        assert_eq!(textures.statistics().placed_allocation_count, 0);
        assert!(device.debug_messages().is_empty(), "{:?}", device.debug_messages());
    }

    #[test]
    fn a_full_heap_causes_a_new_heap() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);
        // 1 MiB each: four fill the first heap exactly.
        let desc = TextureDesc::texture_2d(512, 512, TextureFormat::Rgba8Unorm);
        let mut all: Vec<GpuTexture> = (0..5)
            .map(|_| textures.alloc_texture(&mut device, &desc, &rgba(512, 512)).unwrap())
            .collect();
        assert_eq!(device.live_heap_count(), 2);
        assert_eq!(textures.statistics().heap_count, 2);
        for texture in &mut all {
            textures.free_texture(&mut device, texture);
        }
    }

    #[test]
    fn wrong_pixel_size_is_rejected() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);
        let desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm);
        let error = textures.alloc_texture(&mut device, &desc, &[0; 10]).unwrap_err();
        assert_eq!(
            error,
            AllocError::PixelDataSize {
                expected: 64,
                actual: 10
            }
        );
    }

    #[test]
    fn timed_out_upload_drains_the_copy_before_releasing_memory() {
        let mut device = SoftDevice::with_latency(4);
        let mut textures = manager(&mut device);
        let free_before = textures.statistics().free_srv_descriptors;

        device.fail_next_fence_waits(1);
        let desc = TextureDesc::texture_2d(16, 16, TextureFormat::Rgba8Unorm);
        let err = textures.alloc_texture(&mut device, &desc, &rgba(16, 16)).unwrap_err();
        assert!(matches!(err, AllocError::Device(DeviceError::FenceTimeout { .. })), "{err:?}");

        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_texture_count(), 0);
        assert_eq!(textures.statistics().free_srv_descriptors, free_before);
        assert!(device.debug_messages().is_empty(), "{:?}", device.debug_messages());
    }

    #[test]
    fn stranded_upload_is_released_by_the_next_upload() {
        let mut device = SoftDevice::with_latency(4);
        let mut textures = manager(&mut device);
        let desc = TextureDesc::texture_2d(16, 16, TextureFormat::Rgba8Unorm);

        // Both the timed wait and the drain fail, so nothing may be freed yet.
        device.fail_next_fence_waits(2);
        assert!(textures.alloc_texture(&mut device, &desc, &rgba(16, 16)).is_err());
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(device.live_texture_count(), 1);
        assert_eq!(textures.statistics().placed_allocation_count, 1);

        let mut texture = textures.alloc_texture(&mut device, &desc, &rgba(16, 16)).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_texture_count(), 1);
        assert_eq!(textures.statistics().placed_allocation_count, 1);
        assert_eq!(device.read_texture(texture.texture_id().unwrap()).unwrap(), rgba(16, 16));

        textures.free_texture(&mut device, &mut texture);
        textures.shutdown(&mut device);
        assert!(device.debug_messages().is_empty(), "{:?}", device.debug_messages());
    }

    #[test]
    fn device_failure_leaves_no_descriptor_behind() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);
        let free_before = textures.statistics().free_srv_descriptors;

        device.fail_next_creations(1);
        let desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm);
        assert!(textures.alloc_texture(&mut device, &desc, &rgba(4, 4)).is_err());
        assert_eq!(textures.statistics().free_srv_descriptors, free_before);
    }

    #[test]
    fn render_targets_get_views_and_release_them() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);

        let mut color = textures
            .alloc_render_target(&mut device, 64, 32, 2, 1, Some(SharedDepthStencil::Layers))
            .unwrap();
        let mut depth = textures.alloc_depth_stencil(&mut device, 64, 32, 2).unwrap();
        assert_eq!(color.dimensions(), (64, 32));
        assert!(color.view().is_some());
        assert!(color.srv().is_some());
        assert!(depth.is_depth_stencil());
        assert_eq!(depth.state(), ResourceState::DepthWrite);

        let stats = textures.statistics();
        assert_eq!(stats.live_rtv_descriptors, 1);
        assert_eq!(stats.live_dsv_descriptors, 1);

        textures.free_framebuffer(&mut device, &mut color);
        textures.free_framebuffer(&mut device, &mut depth);
        let stats = textures.statistics();
        assert_eq!(stats.live_rtv_descriptors, 0);
        assert_eq!(stats.live_dsv_descriptors, 0);
        assert_eq!(device.live_texture_count(), 0);
    }

    #[test]
    fn rtv_exhaustion_is_reported() {
        let mut device = SoftDevice::new();
        let config = TextureMemoryConfig {
            rtv_descriptor_count: 1,
            ..Default::default()
        };
        let mut textures =
            TextureMemoryManager::new(&mut device, config, Duration::from_secs(1), Arc::default()).unwrap();
        let mut first = textures.alloc_render_target(&mut device, 8, 8, 1, 0, None).unwrap();
        let error = textures.alloc_render_target(&mut device, 8, 8, 1, 1, None).unwrap_err();
        assert_eq!(
            error,
            AllocError::OutOfDescriptors {
                heap: DescriptorHeapKind::Rtv,
                count: 1
            }
        );
        // The failed target did not leak its texture.
        assert_eq!(device.live_texture_count(), 1);
        textures.free_framebuffer(&mut device, &mut first);
    }

    #[test]
    fn shutdown_releases_device_objects() {
        let mut device = SoftDevice::new();
        let mut textures = manager(&mut device);
        let desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm);
        let mut texture = textures.alloc_texture(&mut device, &desc, &rgba(4, 4)).unwrap();
        textures.free_texture(&mut device, &mut texture);
        textures.shutdown(&mut device);
        assert_eq!(device.live_heap_count(), 0);
    }
}
