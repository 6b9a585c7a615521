//! The D3D12 surface the backend is written against.
//!
//! [`Device`] mirrors the subset of `ID3D12Device`, `ID3D12CommandQueue`,
//! `ID3D12GraphicsCommandList`, `ID3D12Fence` and `IDXGISwapChain3` that the
//! memory managers and the renderer use. Objects are referred to by small
//! typed ids instead of COM pointers; an implementation owns the objects and
//! releases them in the matching `destroy_*` call.

mod command;
mod format;
mod pipeline;

use std::fmt;
use std::time::Duration;

use crate::error::DeviceError;

pub use command::{Command, CopyRegion, ScissorRect, Viewport};
pub use format::{
    copyable_footprint, ClearValue, PlacedFootprint, ResourceState, TextureDesc, TextureFormat,
    TextureUsage,
};
pub use pipeline::{
    BlendState, PipelineStateDesc, RootSignatureDesc, ShaderProgram, StencilState,
};

/// `D3D12_SMALL_RESOURCE_PLACEMENT_ALIGNMENT`.
pub const SMALL_RESOURCE_PLACEMENT_ALIGNMENT: u64 = 4096;
/// `D3D12_DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT`.
pub const DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;
/// `D3D12_DEFAULT_MSAA_RESOURCE_PLACEMENT_ALIGNMENT`.
pub const DEFAULT_MSAA_RESOURCE_PLACEMENT_ALIGNMENT: u64 = 4 * 1024 * 1024;
/// `D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT`.
pub const CONSTANT_BUFFER_PLACEMENT_ALIGNMENT: u64 = 256;
/// `D3D12_TEXTURE_DATA_PITCH_ALIGNMENT`.
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;

/// Largest most-detailed-mip size that may use the small placement alignment.
pub const SMALL_RESOURCE_MAX_BYTES: u64 = 64 * 1024;

macro_rules! device_ids {
    ($($(#[$meta:meta])* $name:ident => $kind:literal,)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);

            impl $name {
                pub const KIND: &'static str = $kind;
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}#{}", $kind, self.0)
                }
            }
        )*
    };
}

device_ids! {
    /// Persistently mapped upload-heap buffer.
    BufferId => "buffer",
    HeapId => "heap",
    TextureId => "texture",
    DescriptorHeapId => "descriptor heap",
    RootSignatureId => "root signature",
    PipelineStateId => "pipeline state",
    QueueId => "command queue",
    CommandAllocatorId => "command allocator",
    CommandListId => "command list",
    FenceId => "fence",
    SwapchainId => "swapchain",
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Direct,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Rtv,
    Dsv,
}

/// A descriptor slot: heap plus index in units of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    pub heap: DescriptorHeapId,
    pub index: u32,
}

/// Result of `GetResourceAllocationInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAllocationInfo {
    pub size: u64,
    pub alignment: u64,
}

pub trait Device {
    // ---------------------------------------------------------------------
    // Memory
    // ---------------------------------------------------------------------

    /// Creates a buffer on the upload heap. It stays mapped for its lifetime.
    fn create_upload_buffer(&mut self, size: u64) -> Result<BufferId, DeviceError>;
    /// Copies `data` into the mapping of `buffer` at `offset`.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Creates a default-heap heap that placed textures can be carved from.
    fn create_heap(&mut self, size: u64) -> Result<HeapId, DeviceError>;
    fn destroy_heap(&mut self, heap: HeapId);

    // ---------------------------------------------------------------------
    // Textures
    // ---------------------------------------------------------------------

    /// Size and alignment a placed resource described by `desc` needs.
    ///
    /// The returned alignment may be larger than `alignment` when the device
    /// cannot honour the requested one.
    fn resource_allocation_info(&self, desc: &TextureDesc, alignment: u64) -> ResourceAllocationInfo;
    fn create_placed_texture(
        &mut self,
        heap: HeapId,
        offset: u64,
        desc: &TextureDesc,
        initial_state: ResourceState,
    ) -> Result<TextureId, DeviceError>;
    fn create_committed_texture(
        &mut self,
        desc: &TextureDesc,
        initial_state: ResourceState,
        optimized_clear: Option<ClearValue>,
    ) -> Result<TextureId, DeviceError>;
    fn destroy_texture(&mut self, texture: TextureId);

    /// Debug readback of the first subresource, tightly packed.
    fn read_texture(&self, _texture: TextureId) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::Unsupported("read_texture"))
    }

    // ---------------------------------------------------------------------
    // Descriptors
    // ---------------------------------------------------------------------

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeapId, DeviceError>;
    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapId);
    /// Bytes between two consecutive descriptors of `kind`.
    fn descriptor_increment_size(&self, kind: DescriptorHeapKind) -> u32;
    fn create_shader_resource_view(
        &mut self,
        texture: TextureId,
        dst: DescriptorHandle,
    ) -> Result<(), DeviceError>;
    fn create_render_target_view(
        &mut self,
        texture: TextureId,
        dst: DescriptorHandle,
    ) -> Result<(), DeviceError>;
    fn create_depth_stencil_view(
        &mut self,
        texture: TextureId,
        dst: DescriptorHandle,
    ) -> Result<(), DeviceError>;

    // ---------------------------------------------------------------------
    // Pipelines
    // ---------------------------------------------------------------------

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> Result<RootSignatureId, DeviceError>;
    fn destroy_root_signature(&mut self, root_signature: RootSignatureId);
    fn create_pipeline_state(&mut self, desc: &PipelineStateDesc) -> Result<PipelineStateId, DeviceError>;
    fn destroy_pipeline_state(&mut self, pipeline: PipelineStateId);

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    fn create_command_queue(&mut self, kind: QueueKind) -> Result<QueueId, DeviceError>;
    fn destroy_command_queue(&mut self, queue: QueueId);
    fn create_command_allocator(&mut self, kind: QueueKind) -> Result<CommandAllocatorId, DeviceError>;
    /// Fails while command lists recorded from `allocator` are still executing.
    fn reset_command_allocator(&mut self, allocator: CommandAllocatorId) -> Result<(), DeviceError>;
    fn destroy_command_allocator(&mut self, allocator: CommandAllocatorId);
    /// Lists are created closed.
    fn create_command_list(&mut self, kind: QueueKind) -> Result<CommandListId, DeviceError>;
    /// Reopens `list` for recording into `allocator`.
    fn reset_command_list(
        &mut self,
        list: CommandListId,
        allocator: CommandAllocatorId,
    ) -> Result<(), DeviceError>;
    fn record(&mut self, list: CommandListId, command: Command) -> Result<(), DeviceError>;
    fn close_command_list(&mut self, list: CommandListId) -> Result<(), DeviceError>;
    fn destroy_command_list(&mut self, list: CommandListId);
    fn execute_command_list(&mut self, queue: QueueId, list: CommandListId) -> Result<(), DeviceError>;

    fn create_fence(&mut self, initial_value: u64) -> Result<FenceId, DeviceError>;
    fn destroy_fence(&mut self, fence: FenceId);
    /// Queues a GPU-side signal of `value` on `fence` behind all work submitted to `queue`.
    fn signal(&mut self, queue: QueueId, fence: FenceId, value: u64) -> Result<(), DeviceError>;
    fn completed_fence_value(&self, fence: FenceId) -> Result<u64, DeviceError>;
    /// Blocks the calling thread until `fence` reaches `value`.
    fn wait_for_fence(&mut self, fence: FenceId, value: u64, timeout: Duration) -> Result<(), DeviceError>;

    // ---------------------------------------------------------------------
    // Swapchain
    // ---------------------------------------------------------------------

    fn create_swapchain(
        &mut self,
        queue: QueueId,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> Result<SwapchainId, DeviceError>;
    /// Recreates the back buffers; ids returned by [`Device::swapchain_buffer`] before the
    /// resize are invalidated.
    fn resize_swapchain(&mut self, swapchain: SwapchainId, width: u32, height: u32) -> Result<(), DeviceError>;
    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId, DeviceError>;
    fn current_back_buffer_index(&self, swapchain: SwapchainId) -> Result<u32, DeviceError>;
    fn present(&mut self, swapchain: SwapchainId, vsync: bool) -> Result<(), DeviceError>;
    fn destroy_swapchain(&mut self, swapchain: SwapchainId);
}
