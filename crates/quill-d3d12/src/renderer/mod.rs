//! The per-frame orchestrator: swapchain, command submission, fence pacing
//! and the public draw contract.

mod compositing;
mod draw;

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};

use crate::config::{RendererConfig, CONSTANT_BUFFER_SLOT_SIZE};
use crate::device::{
    Command, CommandAllocatorId, CommandListId, Device, FenceId, QueueId, QueueKind, ResourceState,
    RootSignatureId, SwapchainId, TextureId,
};
use crate::error::RenderError;
use crate::filter::CompiledFilter;
use crate::geometry::{self, Rectanglei};
use crate::handles::{HandleTable, LayerHandle, TextureHandle};
use crate::layers::{RenderLayerStack, SharedDepthStencil};
use crate::memory::{
    BufferMemoryManager, BufferMemoryStatistics, ConstantBuffer, GeometryBuffers, GpuTexture,
    TextureMemoryManager, TextureMemoryStatistics, ViewDescriptor,
};
use crate::program::{PipelineTable, ProgramId};
use crate::shader::CompiledShader;
use crate::stats::{RendererStats, RendererStatsSnapshot};
use crate::validation::Validator;

/// How a layer is composited onto its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Premultiplied-alpha blending.
    Blend,
    /// Overwrites the destination.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClipMaskOperation {
    /// Only the geometry is inside the mask.
    Set,
    /// Everything but the geometry is inside the mask.
    SetInverse,
    /// The mask shrinks to its intersection with the geometry.
    Intersect,
}

/// What a textured draw samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSource {
    Texture(TextureHandle),
    /// An active layer; it is resolved first.
    Layer(LayerHandle),
}

/// Vertex constants at the start of every constant buffer slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct VertexConstants {
    pub transform: [f32; 16],
    pub translation: [f32; 2],
    pub _pad: [f32; 2],
    /// Texture coordinates are remapped as `uv * scale + offset`.
    pub texcoord_offset: [f32; 2],
    pub texcoord_scale: [f32; 2],
}

impl VertexConstants {
    fn new(transform: Mat4, translation: Vec2) -> Self {
        Self {
            transform: transform.to_cols_array(),
            translation: translation.to_array(),
            _pad: [0.0; 2],
            texcoord_offset: [0.0; 2],
            texcoord_scale: [1.0; 2],
        }
    }

    fn with_texcoords(mut self, offset: Vec2, scale: Vec2) -> Self {
        self.texcoord_offset = offset.to_array();
        self.texcoord_scale = scale.to_array();
        self
    }
}

/// Byte offset of the pixel constants within a slot.
const PIXEL_CONSTANTS_OFFSET: u64 = 256;

/// Resources owned by one back buffer slot.
#[derive(Debug)]
struct FrameResources {
    allocator: CommandAllocatorId,
    /// Fence value signalled after this slot's last submission.
    fence_value: u64,
    constant_buffers: Vec<ConstantBuffer>,
    used_constant_buffers: usize,
}

#[derive(Debug)]
struct BackBuffer {
    texture: TextureId,
    rtv: ViewDescriptor,
    state: ResourceState,
}

#[derive(Debug)]
struct Swapchain {
    id: SwapchainId,
    back_buffers: Vec<BackBuffer>,
}

/// A handle-owned object that stays usable until its release retires.
#[derive(Debug)]
struct Releasable<T> {
    value: T,
    released: bool,
}

impl<T> Releasable<T> {
    fn new(value: T) -> Self {
        Self { value, released: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Geometry(u32),
    Texture(u32),
}

#[derive(Debug)]
struct PendingRelease {
    resource: Retired,
    /// Fence value after which the GPU no longer reads the resource; `None`
    /// until the current frame is submitted.
    after: Option<u64>,
}

/// Draw state reset at the start of every frame.
#[derive(Debug, Default)]
struct FrameState {
    in_frame: bool,
    transform: Option<Mat4>,
    scissor_enabled: bool,
    scissor: Rectanglei,
    scissor_invalid: bool,
    clip_mask_enabled: bool,
    stencil_test_value: u8,
    program: Option<ProgramId>,
    root_signature: Option<RootSignatureId>,
}

/// Direct3D 12 implementation of the render interface.
///
/// One instance owns the device and every GPU object it creates. All calls
/// happen on one thread; GPU lifetimes are guarded by a single frame fence:
/// a back buffer slot's allocator and constant buffers are reused only after
/// the fence passed the value signalled at the end of that slot's last frame.
#[derive(Debug)]
pub struct RenderInterface<D: Device> {
    device: D,
    config: RendererConfig,
    validator: Validator,
    stats: Arc<RendererStats>,

    buffers: BufferMemoryManager,
    textures: TextureMemoryManager,
    layers: RenderLayerStack,
    pipelines: PipelineTable,

    queue: QueueId,
    command_list: CommandListId,
    fence: FenceId,
    frames: Vec<FrameResources>,
    frame_index: usize,
    next_fence_value: u64,
    last_signaled_value: u64,

    swapchain: Option<Swapchain>,
    viewport: (u32, u32),
    swapchain_valid: bool,
    projection: Mat4,
    frame: FrameState,

    geometries: HandleTable<Releasable<GeometryBuffers>>,
    texture_table: HandleTable<Releasable<GpuTexture>>,
    filters: HandleTable<CompiledFilter>,
    shaders: HandleTable<CompiledShader>,
    pending_releases: Vec<PendingRelease>,
    fullscreen_quad: GeometryBuffers,
    shut_down: bool,
}

impl<D: Device> RenderInterface<D> {
    /// Creates the managers, pipelines, queue, command list, fence and the
    /// per-slot resources. The swapchain is created by the first
    /// [`RenderInterface::set_viewport`].
    pub fn new(device: D, config: RendererConfig) -> Result<Self, RenderError> {
        let mut device = device;
        let stats = Arc::new(RendererStats::new());
        let validator = Validator::new(config.validation);

        let mut buffers = BufferMemoryManager::new(&mut device, config.buffers, stats.clone())?;
        let textures =
            TextureMemoryManager::new(&mut device, config.textures, config.fence_timeout, stats.clone())?;
        let pipelines = PipelineTable::new(&mut device, config.msaa_sample_count)?;

        let queue = device.create_command_queue(QueueKind::Direct)?;
        let command_list = device.create_command_list(QueueKind::Direct)?;
        let fence = device.create_fence(0)?;

        let mut frames = Vec::with_capacity(config.backbuffer_count as usize);
        for _ in 0..config.backbuffer_count.max(1) {
            let allocator = device.create_command_allocator(QueueKind::Direct)?;
            let mut constant_buffers = Vec::with_capacity(config.preallocated_constant_buffers);
            for _ in 0..config.preallocated_constant_buffers {
                let mut constant_buffer = ConstantBuffer::default();
                buffers.alloc_constant_buffer(&mut device, &mut constant_buffer, CONSTANT_BUFFER_SLOT_SIZE)?;
                constant_buffers.push(constant_buffer);
            }
            frames.push(FrameResources {
                allocator,
                fence_value: 0,
                constant_buffers,
                used_constant_buffers: 0,
            });
        }

        // Clip-space quad, texture v growing downwards.
        let (vertices, indices) = geometry::quad(
            Vec2::new(-1.0, -1.0),
            Vec2::new(2.0, 2.0),
            [255; 4],
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 0.0),
        );
        let mut fullscreen_quad = GeometryBuffers::default();
        buffers.alloc_vertex(&mut device, &mut fullscreen_quad, &vertices)?;
        buffers.alloc_index(&mut device, &mut fullscreen_quad, &indices)?;

        tracing::info!(
            backbuffers = config.backbuffer_count,
            msaa = config.msaa_sample_count,
            validation = ?config.validation,
            "render interface initialised"
        );

        Ok(Self {
            device,
            config,
            validator,
            stats,
            buffers,
            textures,
            layers: RenderLayerStack::new(config.msaa_sample_count),
            pipelines,
            queue,
            command_list,
            fence,
            frames,
            frame_index: 0,
            next_fence_value: 1,
            last_signaled_value: 0,
            swapchain: None,
            viewport: (0, 0),
            swapchain_valid: false,
            projection: Mat4::IDENTITY,
            frame: FrameState::default(),
            geometries: HandleTable::default(),
            texture_table: HandleTable::default(),
            filters: HandleTable::default(),
            shaders: HandleTable::default(),
            pending_releases: Vec::new(),
            fullscreen_quad,
            shut_down: false,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn stats(&self) -> RendererStatsSnapshot {
        self.stats.snapshot_with(self.validator.failures())
    }

    pub fn buffer_statistics(&self) -> BufferMemoryStatistics {
        self.buffers.statistics()
    }

    pub fn texture_statistics(&self) -> TextureMemoryStatistics {
        self.textures.statistics()
    }

    pub fn layer_stack(&self) -> &RenderLayerStack {
        &self.layers
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn is_swapchain_valid(&self) -> bool {
        self.swapchain_valid
    }

    pub fn in_frame(&self) -> bool {
        self.frame.in_frame
    }

    /// Back buffer slot the next frame records into.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn fence(&self) -> FenceId {
        self.fence
    }

    pub fn last_signaled_fence_value(&self) -> u64 {
        self.last_signaled_value
    }

    /// Releases waiting for the GPU to finish with their resources.
    pub fn pending_release_count(&self) -> usize {
        self.pending_releases.len()
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    pub fn texture_count(&self) -> usize {
        self.texture_table.len()
    }

    /// Resizes (or first creates) the swapchain.
    ///
    /// A zero-sized window suspends the swapchain instead; frames are refused
    /// until a later call with a non-zero size, see
    /// [`RenderInterface::recreate_swapchain`].
    pub fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        if self.frame.in_frame {
            return Err(self.invalid("set_viewport", RenderError::InvalidState("set_viewport inside a frame")));
        }
        self.viewport = (width, height);
        self.wait_for_gpu_idle()?;

        if width == 0 || height == 0 {
            self.swapchain_valid = false;
            tracing::info!(width, height, "window has no area; swapchain suspended");
            return Ok(());
        }
        self.projection = Mat4::orthographic_rh(0.0, width as f32, height as f32, 0.0, -10000.0, 10000.0);

        let id = match self.swapchain.take() {
            Some(swapchain) => {
                for back_buffer in swapchain.back_buffers {
                    self.textures.free_external_rtv(back_buffer.rtv)?;
                }
                // Keep the id even if the resize fails so shutdown destroys it.
                self.swapchain = Some(Swapchain {
                    id: swapchain.id,
                    back_buffers: Vec::new(),
                });
                self.swapchain_valid = false;
                self.device.resize_swapchain(swapchain.id, width, height)?;
                self.stats.inc_swapchain_recreations();
                swapchain.id
            }
            None => {
                let id = self
                    .device
                    .create_swapchain(self.queue, width, height, self.config.backbuffer_count)?;
                self.swapchain = Some(Swapchain {
                    id,
                    back_buffers: Vec::new(),
                });
                id
            }
        };

        let mut back_buffers = Vec::with_capacity(self.config.backbuffer_count as usize);
        for index in 0..self.config.backbuffer_count {
            let texture = self.device.swapchain_buffer(id, index)?;
            let rtv = self.textures.alloc_external_rtv(&mut self.device, texture)?;
            back_buffers.push(BackBuffer {
                texture,
                rtv,
                state: ResourceState::Present,
            });
        }
        self.swapchain = Some(Swapchain { id, back_buffers });
        self.frame_index = self.device.current_back_buffer_index(id)? as usize % self.frames.len();
        self.swapchain_valid = true;
        tracing::debug!(width, height, "swapchain ready");
        Ok(())
    }

    /// Re-applies the last requested viewport size.
    pub fn recreate_swapchain(&mut self) -> Result<(), RenderError> {
        let (width, height) = self.viewport;
        self.set_viewport(width, height)
    }

    pub fn begin_frame(&mut self) -> Result<(), RenderError> {
        if self.frame.in_frame {
            return Err(self.invalid("begin_frame", RenderError::InvalidState("begin_frame inside a frame")));
        }
        if !self.swapchain_valid {
            let (width, height) = self.viewport;
            return Err(RenderError::SwapchainInvalid { width, height });
        }

        self.wait_for_frame(self.frame_index)?;
        self.retire_releases();

        let allocator = self.frames[self.frame_index].allocator;
        if let Err(err) = self.device.reset_command_allocator(allocator) {
            return Err(self.invalid("begin_frame", err.into()));
        }
        if let Err(err) = self.device.reset_command_list(self.command_list, allocator) {
            return Err(self.invalid("begin_frame", err.into()));
        }
        self.frames[self.frame_index].used_constant_buffers = 0;
        self.frame = FrameState {
            in_frame: true,
            ..FrameState::default()
        };

        let (width, height) = self.viewport;
        let base = match self.layers.begin_frame(&mut self.device, &mut self.textures, width, height) {
            Ok(base) => base,
            Err(err) => return Err(self.invalid("begin_frame", err)),
        };

        self.record(Command::SetDescriptorHeap(self.textures.srv_heap()));
        self.bind_layer(base);
        self.clear_layer(base, [0.0; 4]);
        if let Some(view) = self
            .layers
            .depth_stencil(SharedDepthStencil::Layers)
            .and_then(|ds| ds.view())
        {
            self.record(Command::ClearDepthStencil {
                view,
                depth: self.config.clear_depth,
                stencil: self.config.clear_stencil,
            });
        }
        Ok(())
    }

    /// Clears the active layer to the configured clear colour.
    pub fn clear(&mut self) {
        if !self.require_frame("clear") {
            return;
        }
        let top = self.layers.top_layer_handle();
        self.clear_layer(top, self.config.clear_color);
    }

    /// Composites the base layer onto the back buffer, submits, presents and
    /// blocks until the next slot's previous frame has completed.
    pub fn end_frame(&mut self) -> Result<(), RenderError> {
        if !self.frame.in_frame {
            return Err(self.invalid("end_frame", RenderError::InvalidState("end_frame without begin_frame")));
        }

        let balanced = self.layers.layers_size() == 1;
        if !balanced {
            self.validator.fail(
                "end_frame",
                format!("{} layers still pushed at the end of the frame", self.layers.layers_size() - 1),
            );
            while self.layers.layers_size() > 1 {
                let _ = self.layers.pop_layer();
            }
        }

        self.present_base_layer();
        self.layers.end_frame()?;
        self.frame.in_frame = false;

        if let Err(err) = self.device.close_command_list(self.command_list) {
            return Err(self.invalid("end_frame", err.into()));
        }
        if let Err(err) = self.device.execute_command_list(self.queue, self.command_list) {
            return Err(self.invalid("end_frame", err.into()));
        }
        if let Some(swapchain) = &self.swapchain {
            if let Err(err) = self.device.present(swapchain.id, self.config.vsync) {
                tracing::warn!(%err, "present failed; swapchain needs to be recreated");
                self.swapchain_valid = false;
            }
        }
        self.move_to_next_frame()?;
        self.stats.inc_frames();

        if balanced {
            Ok(())
        } else {
            Err(RenderError::InvalidState("layer pushes and pops are unbalanced at the end of the frame"))
        }
    }

    /// Signals the frame fence for the slot just submitted, then waits until
    /// the slot about to be used is no longer in flight.
    fn move_to_next_frame(&mut self) -> Result<(), RenderError> {
        let value = self.next_fence_value;
        if let Err(err) = self.device.signal(self.queue, self.fence, value) {
            return Err(self.invalid("end_frame", err.into()));
        }
        self.next_fence_value += 1;
        self.last_signaled_value = value;
        self.frames[self.frame_index].fence_value = value;
        for release in &mut self.pending_releases {
            release.after.get_or_insert(value);
        }

        let count = self.frames.len();
        self.frame_index = match (&self.swapchain, self.swapchain_valid) {
            (Some(swapchain), true) => match self.device.current_back_buffer_index(swapchain.id) {
                Ok(index) => index as usize % count,
                Err(_) => (self.frame_index + 1) % count,
            },
            _ => (self.frame_index + 1) % count,
        };
        self.wait_for_frame(self.frame_index)
    }

    fn wait_for_frame(&mut self, index: usize) -> Result<(), RenderError> {
        let value = self.frames[index].fence_value;
        self.wait_for_fence_value(value)
    }

    fn wait_for_gpu_idle(&mut self) -> Result<(), RenderError> {
        self.wait_for_fence_value(self.last_signaled_value)
    }

    fn wait_for_fence_value(&mut self, value: u64) -> Result<(), RenderError> {
        let completed = self.device.completed_fence_value(self.fence)?;
        if completed >= value {
            return Ok(());
        }
        self.stats.inc_fence_waits();
        tracing::trace!(value, completed, "waiting for frame fence");
        if let Err(err) = self.device.wait_for_fence(self.fence, value, self.config.fence_timeout) {
            return Err(self.invalid("fence wait", err.into()));
        }
        Ok(())
    }

    /// Frees releases whose frames the GPU has finished.
    fn retire_releases(&mut self) {
        let Some(completed) = self
            .validator
            .check(self.device.completed_fence_value(self.fence), "retire releases")
        else {
            return;
        };
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .pending_releases
            .drain(..)
            .partition(|release| release.after.is_some_and(|after| after <= completed));
        self.pending_releases = waiting;

        for release in &ready {
            self.free_retired(release.resource);
        }
        if !ready.is_empty() {
            self.stats.add_deferred_frees(ready.len() as u64);
            tracing::trace!(count = ready.len(), completed, "retired deferred releases");
        }
    }

    fn free_retired(&mut self, resource: Retired) {
        match resource {
            Retired::Geometry(id) => {
                if let Some(mut geometry) = self.geometries.remove(id) {
                    let result = self.buffers.free_geometry(&mut geometry.value);
                    self.validator.check(result, "release geometry");
                }
            }
            Retired::Texture(id) => {
                if let Some(mut texture) = self.texture_table.remove(id) {
                    self.textures.free_texture(&mut self.device, &mut texture.value);
                }
            }
        }
    }

    /// Queues `resource` to be freed once the GPU is done with it.
    fn defer_release(&mut self, resource: Retired) {
        let after = if self.frame.in_frame {
            None
        } else {
            Some(self.last_signaled_value)
        };
        self.pending_releases.push(PendingRelease { resource, after });
    }

    /// Waits for the GPU and releases every object, then the device objects
    /// themselves. Safe to call more than once; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.frame.in_frame {
            tracing::warn!("shutdown inside a frame; the frame is discarded");
            let _ = self.device.close_command_list(self.command_list);
            self.frame.in_frame = false;
        }
        if let Err(err) = self.wait_for_gpu_idle() {
            tracing::error!(%err, "GPU did not go idle before shutdown");
        }

        for release in std::mem::take(&mut self.pending_releases) {
            self.free_retired(release.resource);
        }
        for mut geometry in self.geometries.drain() {
            if let Err(err) = self.buffers.free_geometry(&mut geometry.value) {
                tracing::error!(%err, "freeing geometry at shutdown failed");
            }
        }
        let live_textures: Vec<_> = self.texture_table.drain().collect();
        for mut texture in live_textures {
            self.textures.free_texture(&mut self.device, &mut texture.value);
        }
        if let Err(err) = self.buffers.free_geometry(&mut self.fullscreen_quad) {
            tracing::error!(%err, "freeing fullscreen quad failed");
        }
        for frame in &mut self.frames {
            for constant_buffer in &mut frame.constant_buffers {
                if let Err(err) = self.buffers.free_constant_buffer(constant_buffer) {
                    tracing::error!(%err, "freeing constant buffer failed");
                }
            }
            self.device.destroy_command_allocator(frame.allocator);
        }
        self.frames.clear();

        self.layers.destroy_framebuffers(&mut self.device, &mut self.textures);
        if let Some(swapchain) = self.swapchain.take() {
            for back_buffer in swapchain.back_buffers {
                if let Err(err) = self.textures.free_external_rtv(back_buffer.rtv) {
                    tracing::error!(%err, "freeing back buffer view failed");
                }
            }
            self.device.destroy_swapchain(swapchain.id);
        }
        self.swapchain_valid = false;

        self.pipelines.destroy(&mut self.device);
        self.textures.shutdown(&mut self.device);
        self.buffers.shutdown(&mut self.device);
        self.device.destroy_command_list(self.command_list);
        self.device.destroy_fence(self.fence);
        self.device.destroy_command_queue(self.queue);
        tracing::info!("render interface shut down");
    }

    /// Reports `err` through the validator and hands it back.
    fn invalid(&self, context: &str, err: RenderError) -> RenderError {
        self.validator.fail(context, &err);
        err
    }

    fn require_frame(&self, operation: &str) -> bool {
        self.validator
            .ensure(self.frame.in_frame, operation, || format!("{operation} outside begin_frame/end_frame"))
    }

    /// Records into the frame's command list; failures go to the validator.
    fn record(&mut self, command: Command) {
        let result = self.device.record(self.command_list, command);
        self.validator.check(result, "record");
    }
}

impl<D: Device> Drop for RenderInterface<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
