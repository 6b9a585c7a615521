//! CPU reference implementation of [`Device`].
//!
//! `SoftDevice` keeps real byte storage for upload buffers and textures and
//! executes copies, clears and MSAA resolves on the CPU. Draws are recorded in
//! a log rather than rasterised. Submissions are queued in order and retired
//! either when more than [`SoftDevice::set_latency`] submissions are
//! outstanding or when the CPU waits on a fence, which is enough to surface
//! frame-pacing and lifetime bugs that would otherwise only show on hardware.
//!
//! Misuse that the D3D12 debug layer reports is recorded as a
//! [`DebugMessage`] instead of being turned into a hard error, so tests can
//! assert on `debug_messages().is_empty()` after running a workload.

mod exec;

use std::collections::VecDeque;
use std::time::Duration;

use hashbrown::HashMap;
use quill_valloc::align_up;

use crate::device::{
    BufferId, ClearValue, Command, CommandAllocatorId, CommandListId, DescriptorHandle,
    DescriptorHeapId, DescriptorHeapKind, Device, FenceId, HeapId, PipelineStateDesc,
    PipelineStateId, QueueId, QueueKind, ResourceAllocationInfo, ResourceState,
    RootSignatureDesc, RootSignatureId, ScissorRect, ShaderProgram, StencilState, SwapchainId,
    TextureDesc, TextureFormat, TextureId, TextureUsage, DEFAULT_MSAA_RESOURCE_PLACEMENT_ALIGNMENT,
    DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT, SMALL_RESOURCE_MAX_BYTES,
    SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
};
use crate::error::DeviceError;

const RTV_INCREMENT: u32 = 32;
const DSV_INCREMENT: u32 = 32;
const CBV_SRV_UAV_INCREMENT: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugMessageKind {
    AllocatorResetWhileInFlight,
    RecordIntoClosedList,
    ExecuteOpenList,
    NonMonotonicFenceSignal,
    BarrierStateMismatch,
    InvalidResourceState,
    PlacedResourceOverlap,
    MissingAliasingBarrier,
    DestroyedWhileInUse,
    UnknownObject,
    InvalidView,
    InvalidCopy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    pub kind: DebugMessageKind,
    pub text: String,
}

/// One executed `DrawIndexed`.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub pipeline: PipelineStateId,
    pub label: &'static str,
    pub shader: ShaderProgram,
    pub stencil: StencilState,
    pub stencil_ref: u8,
    pub render_target: Option<TextureId>,
    pub scissor: Option<ScissorRect>,
    pub index_count: u32,
    pub blend_factor: [f32; 4],
}

#[derive(Debug)]
struct SoftBuffer {
    data: Vec<u8>,
}

#[derive(Debug)]
struct SoftHeap {
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    heap: HeapId,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct SoftTexture {
    desc: TextureDesc,
    state: ResourceState,
    placement: Option<Placement>,
    awaiting_aliasing_barrier: bool,
    /// `sample_count` consecutive images, each tightly packed.
    data: Vec<u8>,
}

impl SoftTexture {
    fn new(desc: TextureDesc, state: ResourceState, placement: Option<Placement>) -> Self {
        let len = desc.base_memory() as usize * desc.sample_count.max(1) as usize;
        Self {
            desc,
            state,
            placement,
            awaiting_aliasing_barrier: placement.is_some(),
            data: vec![0; len],
        }
    }

    fn image_len(&self) -> usize {
        self.desc.base_memory() as usize
    }
}

#[derive(Debug)]
struct SoftDescriptorHeap {
    kind: DescriptorHeapKind,
    count: u32,
    views: HashMap<u32, TextureId>,
}

#[derive(Debug)]
struct SoftCommandList {
    kind: QueueKind,
    allocator: Option<CommandAllocatorId>,
    open: bool,
    commands: Vec<Command>,
}

#[derive(Debug, Default)]
struct SoftFence {
    completed: u64,
    last_signaled: u64,
}

#[derive(Debug)]
struct SoftSwapchain {
    width: u32,
    height: u32,
    buffers: Vec<TextureId>,
    current: u32,
}

#[derive(Debug)]
enum Submission {
    Commands {
        kind: QueueKind,
        allocator: Option<CommandAllocatorId>,
        commands: Vec<Command>,
    },
    Signal {
        fence: FenceId,
        value: u64,
    },
    Present {
        buffer: TextureId,
    },
}

impl Submission {
    fn references_texture(&self, texture: TextureId) -> bool {
        match self {
            Submission::Commands { commands, .. } => {
                commands.iter().any(|command| command.textures().contains(&texture))
            }
            Submission::Present { buffer } => *buffer == texture,
            Submission::Signal { .. } => false,
        }
    }

    fn references_buffer(&self, buffer: BufferId) -> bool {
        match self {
            Submission::Commands { commands, .. } => {
                commands.iter().any(|command| command.buffer() == Some(buffer))
            }
            Submission::Signal { .. } | Submission::Present { .. } => false,
        }
    }
}

fn unknown(kind: &'static str, id: u32) -> DeviceError {
    DeviceError::UnknownObject { kind, id }
}

#[derive(Debug, Default)]
pub struct SoftDevice {
    next_id: u32,
    latency: usize,

    buffers: HashMap<BufferId, SoftBuffer>,
    heaps: HashMap<HeapId, SoftHeap>,
    textures: HashMap<TextureId, SoftTexture>,
    descriptor_heaps: HashMap<DescriptorHeapId, SoftDescriptorHeap>,
    root_signatures: HashMap<RootSignatureId, RootSignatureDesc>,
    pipelines: HashMap<PipelineStateId, PipelineStateDesc>,
    queues: HashMap<QueueId, QueueKind>,
    allocators: HashMap<CommandAllocatorId, QueueKind>,
    lists: HashMap<CommandListId, SoftCommandList>,
    fences: HashMap<FenceId, SoftFence>,
    swapchains: HashMap<SwapchainId, SoftSwapchain>,

    pending: VecDeque<Submission>,
    messages: Vec<DebugMessage>,
    draws: Vec<DrawRecord>,

    fail_creations: u32,
    fail_presents: u32,
    fail_waits: u32,
    presents: u64,
    increments: HashMap<DescriptorHeapKind, u32>,
}

impl SoftDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaves up to `latency` submissions (command lists and fence signals)
    /// outstanding before the oldest is retired.
    pub fn with_latency(latency: usize) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_latency(&mut self, latency: usize) {
        self.latency = latency;
        self.pump();
    }

    /// Makes the next `count` buffer, heap or texture creations fail.
    pub fn fail_next_creations(&mut self, count: u32) {
        self.fail_creations = count;
    }

    /// Makes the next `count` presents report the swapchain as unavailable.
    pub fn fail_next_presents(&mut self, count: u32) {
        self.fail_presents = count;
    }

    /// Makes the next `count` fence waits time out without retiring any work.
    pub fn fail_next_fence_waits(&mut self, count: u32) {
        self.fail_waits = count;
    }

    /// Overrides the descriptor stride reported for `kind`.
    pub fn set_descriptor_increment(&mut self, kind: DescriptorHeapKind, size: u32) {
        self.increments.insert(kind, size);
    }

    /// Retires every queued submission.
    pub fn complete_all_work(&mut self) {
        while let Some(submission) = self.pending.pop_front() {
            self.retire(submission);
        }
    }

    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    pub fn debug_messages(&self) -> &[DebugMessage] {
        &self.messages
    }

    pub fn take_debug_messages(&mut self) -> Vec<DebugMessage> {
        std::mem::take(&mut self.messages)
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn take_draws(&mut self) -> Vec<DrawRecord> {
        std::mem::take(&mut self.draws)
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_heap_count(&self) -> usize {
        self.heaps.len()
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        self.buffers.get(&buffer).map(|b| b.data.len() as u64)
    }

    /// Bytes currently stored in `buffer`'s mapping.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.textures.get(&texture).map(|t| t.desc)
    }

    pub fn texture_state(&self, texture: TextureId) -> Option<ResourceState> {
        self.textures.get(&texture).map(|t| t.state)
    }

    /// Heap and offset of a placed texture; `None` for committed ones.
    pub fn texture_placement(&self, texture: TextureId) -> Option<(HeapId, u64)> {
        self.textures
            .get(&texture)
            .and_then(|t| t.placement)
            .map(|p| (p.heap, p.offset))
    }

    pub fn live_root_signature_count(&self) -> usize {
        self.root_signatures.len()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn message(&mut self, kind: DebugMessageKind, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!(?kind, "{text}");
        self.messages.push(DebugMessage { kind, text });
    }

    fn injected_failure(&mut self, requested: u64) -> Result<(), DeviceError> {
        if self.fail_creations > 0 {
            self.fail_creations -= 1;
            return Err(DeviceError::OutOfDeviceMemory { requested });
        }
        Ok(())
    }

    fn allocator_in_flight(&self, allocator: CommandAllocatorId) -> bool {
        self.pending.iter().any(|submission| {
            matches!(submission, Submission::Commands { allocator: Some(a), .. } if *a == allocator)
        })
    }

    fn pump(&mut self) {
        while self.pending.len() > self.latency {
            if let Some(submission) = self.pending.pop_front() {
                self.retire(submission);
            }
        }
    }

    fn retire(&mut self, submission: Submission) {
        match submission {
            Submission::Commands { kind, commands, .. } => self.execute_commands(kind, &commands),
            Submission::Signal { fence, value } => {
                if let Some(f) = self.fences.get_mut(&fence) {
                    f.completed = f.completed.max(value);
                }
            }
            Submission::Present { buffer } => {
                let state = self.texture_state(buffer);
                if state.is_some() && state != Some(ResourceState::Present) {
                    self.message(
                        DebugMessageKind::InvalidResourceState,
                        format!("{buffer} presented in state {state:?}"),
                    );
                }
            }
        }
    }

    fn descriptor_heap_for_view(
        &mut self,
        dst: DescriptorHandle,
        expected: DescriptorHeapKind,
    ) -> Result<&mut SoftDescriptorHeap, DeviceError> {
        let heap = self
            .descriptor_heaps
            .get_mut(&dst.heap)
            .ok_or_else(|| unknown(DescriptorHeapId::KIND, dst.heap.0))?;
        if heap.kind != expected {
            return Err(DeviceError::InvalidArgument(format!(
                "{} is a {:?} heap, expected {:?}",
                dst.heap, heap.kind, expected
            )));
        }
        if dst.index >= heap.count {
            return Err(DeviceError::InvalidArgument(format!(
                "descriptor index {} out of range for {} ({} descriptors)",
                dst.index, dst.heap, heap.count
            )));
        }
        Ok(heap)
    }

    fn create_view(
        &mut self,
        texture: TextureId,
        dst: DescriptorHandle,
        kind: DescriptorHeapKind,
        required: TextureUsage,
    ) -> Result<(), DeviceError> {
        let usage = self
            .textures
            .get(&texture)
            .map(|t| t.desc.usage)
            .ok_or_else(|| unknown(TextureId::KIND, texture.0))?;
        if !usage.contains(required) {
            self.message(
                DebugMessageKind::InvalidView,
                format!("{texture} lacks {required:?} usage for a {kind:?} view"),
            );
        }
        let heap = self.descriptor_heap_for_view(dst, kind)?;
        heap.views.insert(dst.index, texture);
        Ok(())
    }

    fn create_texture_entry(&mut self, texture: SoftTexture) -> TextureId {
        let id = TextureId(self.alloc_id());
        self.textures.insert(id, texture);
        id
    }
}

impl Device for SoftDevice {
    fn create_upload_buffer(&mut self, size: u64) -> Result<BufferId, DeviceError> {
        self.injected_failure(size)?;
        if size == 0 {
            return Err(DeviceError::InvalidArgument("zero-sized buffer".into()));
        }
        let id = BufferId(self.alloc_id());
        self.buffers.insert(
            id,
            SoftBuffer {
                data: vec![0; size as usize],
            },
        );
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| unknown(BufferId::KIND, buffer.0))?;
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= target.data.len())
            .ok_or_else(|| {
                DeviceError::InvalidArgument(format!(
                    "write of {} bytes at {offset} overruns {buffer} ({} bytes)",
                    data.len(),
                    target.data.len()
                ))
            })?;
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.pending.iter().any(|s| s.references_buffer(buffer)) {
            self.message(
                DebugMessageKind::DestroyedWhileInUse,
                format!("{buffer} destroyed while queued GPU work still reads it"),
            );
        }
        self.buffers.remove(&buffer);
    }

    fn create_heap(&mut self, size: u64) -> Result<HeapId, DeviceError> {
        self.injected_failure(size)?;
        if size == 0 {
            return Err(DeviceError::InvalidArgument("zero-sized heap".into()));
        }
        let id = HeapId(self.alloc_id());
        self.heaps.insert(id, SoftHeap { size });
        Ok(id)
    }

    fn destroy_heap(&mut self, heap: HeapId) {
        let still_placed = self
            .textures
            .values()
            .filter(|t| t.placement.map(|p| p.heap) == Some(heap))
            .count();
        if still_placed > 0 {
            self.message(
                DebugMessageKind::DestroyedWhileInUse,
                format!("{heap} destroyed with {still_placed} placed texture(s) alive"),
            );
        }
        self.heaps.remove(&heap);
    }

    fn resource_allocation_info(&self, desc: &TextureDesc, alignment: u64) -> ResourceAllocationInfo {
        let samples = desc.sample_count.max(1) as u64;
        let mut total = 0u64;
        let (mut width, mut height) = (desc.width.max(1) as u64, desc.height.max(1) as u64);
        for _ in 0..desc.mip_levels.max(1) {
            total += width * height * desc.format.bytes_per_pixel() as u64 * samples;
            width = (width / 2).max(1);
            height = (height / 2).max(1);
        }

        let alignment = if samples > 1 {
            DEFAULT_MSAA_RESOURCE_PLACEMENT_ALIGNMENT
        } else if alignment <= SMALL_RESOURCE_PLACEMENT_ALIGNMENT
            && desc.base_memory() <= SMALL_RESOURCE_MAX_BYTES
            && !desc
                .usage
                .intersects(TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL)
        {
            SMALL_RESOURCE_PLACEMENT_ALIGNMENT
        } else {
            DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT
        };

        ResourceAllocationInfo {
            size: align_up(total, alignment),
            alignment,
        }
    }

    fn create_placed_texture(
        &mut self,
        heap: HeapId,
        offset: u64,
        desc: &TextureDesc,
        initial_state: ResourceState,
    ) -> Result<TextureId, DeviceError> {
        self.injected_failure(desc.base_memory())?;
        let heap_size = self
            .heaps
            .get(&heap)
            .map(|h| h.size)
            .ok_or_else(|| unknown(HeapId::KIND, heap.0))?;
        let info = self.resource_allocation_info(desc, SMALL_RESOURCE_PLACEMENT_ALIGNMENT);
        if offset % info.alignment != 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "placed offset {offset} is not aligned to {}",
                info.alignment
            )));
        }
        if offset + info.size > heap_size {
            return Err(DeviceError::InvalidArgument(format!(
                "placed texture [{offset}, {}) exceeds {heap} ({heap_size} bytes)",
                offset + info.size
            )));
        }

        let overlapping = self.textures.iter().find_map(|(id, t)| {
            let p = t.placement?;
            (p.heap == heap && p.offset < offset + info.size && offset < p.offset + p.size)
                .then_some(*id)
        });
        if let Some(other) = overlapping {
            self.message(
                DebugMessageKind::PlacedResourceOverlap,
                format!("placed texture at {heap}+{offset} overlaps live {other}"),
            );
        }

        let placement = Placement {
            heap,
            offset,
            size: info.size,
        };
        Ok(self.create_texture_entry(SoftTexture::new(*desc, initial_state, Some(placement))))
    }

    fn create_committed_texture(
        &mut self,
        desc: &TextureDesc,
        initial_state: ResourceState,
        optimized_clear: Option<ClearValue>,
    ) -> Result<TextureId, DeviceError> {
        self.injected_failure(desc.base_memory())?;
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "zero-sized texture {}x{}",
                desc.width, desc.height
            )));
        }
        match (optimized_clear, desc.format.is_depth_stencil()) {
            (Some(ClearValue::Color(_)), true) | (Some(ClearValue::DepthStencil { .. }), false) => {
                return Err(DeviceError::InvalidArgument(
                    "optimized clear value does not match the texture format".into(),
                ));
            }
            _ => {}
        }
        Ok(self.create_texture_entry(SoftTexture::new(*desc, initial_state, None)))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.pending.iter().any(|s| s.references_texture(texture)) {
            self.message(
                DebugMessageKind::DestroyedWhileInUse,
                format!("{texture} destroyed while queued GPU work still uses it"),
            );
        }
        self.textures.remove(&texture);
        for heap in self.descriptor_heaps.values_mut() {
            heap.views.retain(|_, t| *t != texture);
        }
    }

    fn read_texture(&self, texture: TextureId) -> Result<Vec<u8>, DeviceError> {
        let t = self
            .textures
            .get(&texture)
            .ok_or_else(|| unknown(TextureId::KIND, texture.0))?;
        Ok(t.data[..t.image_len()].to_vec())
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeapId, DeviceError> {
        if shader_visible && kind != DescriptorHeapKind::CbvSrvUav {
            return Err(DeviceError::InvalidArgument(format!(
                "{kind:?} descriptor heaps cannot be shader visible"
            )));
        }
        if count == 0 {
            return Err(DeviceError::InvalidArgument("empty descriptor heap".into()));
        }
        let id = DescriptorHeapId(self.alloc_id());
        self.descriptor_heaps.insert(
            id,
            SoftDescriptorHeap {
                kind,
                count,
                views: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapId) {
        self.descriptor_heaps.remove(&heap);
    }

    fn descriptor_increment_size(&self, kind: DescriptorHeapKind) -> u32 {
        if let Some(&size) = self.increments.get(&kind) {
            return size;
        }
        match kind {
            DescriptorHeapKind::CbvSrvUav => CBV_SRV_UAV_INCREMENT,
            DescriptorHeapKind::Rtv => RTV_INCREMENT,
            DescriptorHeapKind::Dsv => DSV_INCREMENT,
        }
    }

    fn create_shader_resource_view(
        &mut self,
        texture: TextureId,
        dst: DescriptorHandle,
    ) -> Result<(), DeviceError> {
        self.create_view(
            texture,
            dst,
            DescriptorHeapKind::CbvSrvUav,
            TextureUsage::SHADER_RESOURCE,
        )
    }

    fn create_render_target_view(
        &mut self,
        texture: TextureId,
        dst: DescriptorHandle,
    ) -> Result<(), DeviceError> {
        self.create_view(texture, dst, DescriptorHeapKind::Rtv, TextureUsage::RENDER_TARGET)
    }

    fn create_depth_stencil_view(
        &mut self,
        texture: TextureId,
        dst: DescriptorHandle,
    ) -> Result<(), DeviceError> {
        self.create_view(texture, dst, DescriptorHeapKind::Dsv, TextureUsage::DEPTH_STENCIL)
    }

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> Result<RootSignatureId, DeviceError> {
        if desc.parameter_count() > 64 {
            return Err(DeviceError::InvalidArgument(
                "root signature exceeds 64 parameters".into(),
            ));
        }
        let id = RootSignatureId(self.alloc_id());
        self.root_signatures.insert(id, *desc);
        Ok(id)
    }

    fn destroy_root_signature(&mut self, root_signature: RootSignatureId) {
        self.root_signatures.remove(&root_signature);
    }

    fn create_pipeline_state(&mut self, desc: &PipelineStateDesc) -> Result<PipelineStateId, DeviceError> {
        if !self.root_signatures.contains_key(&desc.root_signature) {
            return Err(unknown(RootSignatureId::KIND, desc.root_signature.0));
        }
        if desc.stencil != StencilState::Disabled && desc.depth_stencil_format.is_none() {
            return Err(DeviceError::InvalidArgument(format!(
                "pipeline '{}' uses stencil without a depth-stencil format",
                desc.label
            )));
        }
        let id = PipelineStateId(self.alloc_id());
        self.pipelines.insert(id, desc.clone());
        Ok(id)
    }

    fn destroy_pipeline_state(&mut self, pipeline: PipelineStateId) {
        self.pipelines.remove(&pipeline);
    }

    fn create_command_queue(&mut self, kind: QueueKind) -> Result<QueueId, DeviceError> {
        let id = QueueId(self.alloc_id());
        self.queues.insert(id, kind);
        Ok(id)
    }

    fn destroy_command_queue(&mut self, queue: QueueId) {
        self.queues.remove(&queue);
    }

    fn create_command_allocator(&mut self, kind: QueueKind) -> Result<CommandAllocatorId, DeviceError> {
        let id = CommandAllocatorId(self.alloc_id());
        self.allocators.insert(id, kind);
        Ok(id)
    }

    fn reset_command_allocator(&mut self, allocator: CommandAllocatorId) -> Result<(), DeviceError> {
        if !self.allocators.contains_key(&allocator) {
            return Err(unknown(CommandAllocatorId::KIND, allocator.0));
        }
        if self.allocator_in_flight(allocator) {
            self.message(
                DebugMessageKind::AllocatorResetWhileInFlight,
                format!("{allocator} reset while its command lists are still executing"),
            );
            return Err(DeviceError::AllocatorInFlight(allocator.0));
        }
        Ok(())
    }

    fn destroy_command_allocator(&mut self, allocator: CommandAllocatorId) {
        if self.allocator_in_flight(allocator) {
            self.message(
                DebugMessageKind::DestroyedWhileInUse,
                format!("{allocator} destroyed while its command lists are still executing"),
            );
        }
        self.allocators.remove(&allocator);
    }

    fn create_command_list(&mut self, kind: QueueKind) -> Result<CommandListId, DeviceError> {
        let id = CommandListId(self.alloc_id());
        self.lists.insert(
            id,
            SoftCommandList {
                kind,
                allocator: None,
                open: false,
                commands: Vec::new(),
            },
        );
        Ok(id)
    }

    fn reset_command_list(
        &mut self,
        list: CommandListId,
        allocator: CommandAllocatorId,
    ) -> Result<(), DeviceError> {
        let allocator_kind = *self
            .allocators
            .get(&allocator)
            .ok_or_else(|| unknown(CommandAllocatorId::KIND, allocator.0))?;
        let entry = self
            .lists
            .get_mut(&list)
            .ok_or_else(|| unknown(CommandListId::KIND, list.0))?;
        if entry.open {
            return Err(DeviceError::CommandListOpen(list.0));
        }
        if entry.kind != allocator_kind {
            return Err(DeviceError::InvalidArgument(format!(
                "{list} is a {:?} list but {allocator} is a {:?} allocator",
                entry.kind, allocator_kind
            )));
        }
        entry.open = true;
        entry.allocator = Some(allocator);
        entry.commands.clear();
        Ok(())
    }

    fn record(&mut self, list: CommandListId, command: Command) -> Result<(), DeviceError> {
        let entry = self
            .lists
            .get_mut(&list)
            .ok_or_else(|| unknown(CommandListId::KIND, list.0))?;
        if !entry.open {
            self.message(
                DebugMessageKind::RecordIntoClosedList,
                format!("{command:?} recorded into closed {list}"),
            );
            return Err(DeviceError::CommandListClosed(list.0));
        }
        entry.commands.push(command);
        Ok(())
    }

    fn close_command_list(&mut self, list: CommandListId) -> Result<(), DeviceError> {
        let entry = self
            .lists
            .get_mut(&list)
            .ok_or_else(|| unknown(CommandListId::KIND, list.0))?;
        if !entry.open {
            return Err(DeviceError::CommandListClosed(list.0));
        }
        entry.open = false;
        Ok(())
    }

    fn destroy_command_list(&mut self, list: CommandListId) {
        self.lists.remove(&list);
    }

    fn execute_command_list(&mut self, queue: QueueId, list: CommandListId) -> Result<(), DeviceError> {
        let queue_kind = *self
            .queues
            .get(&queue)
            .ok_or_else(|| unknown(QueueId::KIND, queue.0))?;
        let entry = self
            .lists
            .get(&list)
            .ok_or_else(|| unknown(CommandListId::KIND, list.0))?;
        if entry.open {
            self.message(
                DebugMessageKind::ExecuteOpenList,
                format!("{list} executed while still recording"),
            );
            return Err(DeviceError::CommandListOpen(list.0));
        }
        if entry.kind != queue_kind {
            return Err(DeviceError::InvalidArgument(format!(
                "{list} is a {:?} list but {queue} is a {:?} queue",
                entry.kind, queue_kind
            )));
        }
        let submission = Submission::Commands {
            kind: queue_kind,
            allocator: entry.allocator,
            commands: entry.commands.clone(),
        };
        self.pending.push_back(submission);
        self.pump();
        Ok(())
    }

    fn create_fence(&mut self, initial_value: u64) -> Result<FenceId, DeviceError> {
        let id = FenceId(self.alloc_id());
        self.fences.insert(
            id,
            SoftFence {
                completed: initial_value,
                last_signaled: initial_value,
            },
        );
        Ok(id)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn signal(&mut self, queue: QueueId, fence: FenceId, value: u64) -> Result<(), DeviceError> {
        if !self.queues.contains_key(&queue) {
            return Err(unknown(QueueId::KIND, queue.0));
        }
        let entry = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| unknown(FenceId::KIND, fence.0))?;
        let previous = entry.last_signaled;
        entry.last_signaled = value;
        if value <= previous {
            self.message(
                DebugMessageKind::NonMonotonicFenceSignal,
                format!("{fence} signalled {value} after {previous}"),
            );
        }
        self.pending.push_back(Submission::Signal { fence, value });
        self.pump();
        Ok(())
    }

    fn completed_fence_value(&self, fence: FenceId) -> Result<u64, DeviceError> {
        self.fences
            .get(&fence)
            .map(|f| f.completed)
            .ok_or_else(|| unknown(FenceId::KIND, fence.0))
    }

    fn wait_for_fence(&mut self, fence: FenceId, value: u64, timeout: Duration) -> Result<(), DeviceError> {
        let timed_out = DeviceError::FenceTimeout {
            fence: fence.0,
            value,
            timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
        };
        if self.fail_waits > 0 && self.completed_fence_value(fence)? < value {
            self.fail_waits -= 1;
            return Err(timed_out);
        }
        loop {
            if self.completed_fence_value(fence)? >= value {
                return Ok(());
            }
            match self.pending.pop_front() {
                Some(submission) => self.retire(submission),
                None => return Err(timed_out),
            }
        }
    }

    fn create_swapchain(
        &mut self,
        queue: QueueId,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> Result<SwapchainId, DeviceError> {
        if !self.queues.contains_key(&queue) {
            return Err(unknown(QueueId::KIND, queue.0));
        }
        if width == 0 || height == 0 {
            return Err(DeviceError::SwapchainUnavailable(format!(
                "window is {width}x{height}"
            )));
        }
        if !(2..=16).contains(&buffer_count) {
            return Err(DeviceError::InvalidArgument(format!(
                "swapchain buffer count {buffer_count} outside 2..=16"
            )));
        }
        let buffers = self.create_swapchain_buffers(width, height, buffer_count);
        let id = SwapchainId(self.alloc_id());
        self.swapchains.insert(
            id,
            SoftSwapchain {
                width,
                height,
                buffers,
                current: 0,
            },
        );
        Ok(id)
    }

    fn resize_swapchain(&mut self, swapchain: SwapchainId, width: u32, height: u32) -> Result<(), DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::SwapchainUnavailable(format!(
                "window is {width}x{height}"
            )));
        }
        let old = self
            .swapchains
            .get_mut(&swapchain)
            .map(|s| std::mem::take(&mut s.buffers))
            .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))?;
        let count = old.len() as u32;
        for texture in old {
            self.destroy_texture(texture);
        }
        let buffers = self.create_swapchain_buffers(width, height, count);
        if let Some(s) = self.swapchains.get_mut(&swapchain) {
            s.width = width;
            s.height = height;
            s.buffers = buffers;
            s.current = 0;
        }
        Ok(())
    }

    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId, DeviceError> {
        let s = self
            .swapchains
            .get(&swapchain)
            .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))?;
        s.buffers.get(index as usize).copied().ok_or_else(|| {
            DeviceError::InvalidArgument(format!("{swapchain} has no buffer {index}"))
        })
    }

    fn current_back_buffer_index(&self, swapchain: SwapchainId) -> Result<u32, DeviceError> {
        self.swapchains
            .get(&swapchain)
            .map(|s| s.current)
            .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))
    }

    fn present(&mut self, swapchain: SwapchainId, _vsync: bool) -> Result<(), DeviceError> {
        if self.fail_presents > 0 {
            self.fail_presents -= 1;
            return Err(DeviceError::SwapchainUnavailable("present failed".into()));
        }
        let (buffer, count) = {
            let s = self
                .swapchains
                .get(&swapchain)
                .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))?;
            (s.buffers[s.current as usize], s.buffers.len() as u32)
        };

        // Presentation is queued behind the frame's work like any other submission.
        self.pending.push_back(Submission::Present { buffer });
        self.pump();

        if let Some(s) = self.swapchains.get_mut(&swapchain) {
            s.current = (s.current + 1) % count;
        }
        self.presents += 1;
        Ok(())
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainId) {
        if let Some(s) = self.swapchains.remove(&swapchain) {
            for texture in s.buffers {
                self.destroy_texture(texture);
            }
        }
    }
}

impl SoftDevice {
    fn create_swapchain_buffers(&mut self, width: u32, height: u32, count: u32) -> Vec<TextureId> {
        (0..count)
            .map(|_| {
                let desc = TextureDesc::texture_2d(width, height, TextureFormat::Rgba8Unorm)
                    .with_usage(TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC);
                self.create_texture_entry(SoftTexture::new(desc, ResourceState::Present, None))
            })
            .collect()
    }

    /// Size of `swapchain`'s back buffers.
    pub fn swapchain_size(&self, swapchain: SwapchainId) -> Option<(u32, u32)> {
        self.swapchains.get(&swapchain).map(|s| (s.width, s.height))
    }
}

#[cfg(test)]
mod tests;
