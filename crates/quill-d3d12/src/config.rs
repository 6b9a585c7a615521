//! Build-time defaults for the D3D12 backend.
//!
//! Every size the backend uses comes from the constants below. They are the
//! only knobs; there are no environment variables or runtime flags. Embedders
//! that need different budgets build a [`RendererConfig`] with the fields
//! they want changed and `..Default::default()` for the rest.

use std::time::Duration;

use crate::validation::ValidationMode;

/// Number of swapchain back buffers, and therefore frames in flight.
pub const SWAPCHAIN_BACKBUFFER_COUNT: u32 = 3;

/// Size of each persistently mapped upload buffer used for vertex, index and
/// constant data.
pub const BUFFER_ALLOCATION_SIZE: u64 = 2 * 1024 * 1024;

/// Alignment applied to vertex/index sub-allocations.
pub const BUFFER_SIZE_ALIGNMENT: u64 = 16;

/// Size of each heap that placed textures are carved from.
pub const TEXTURE_HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// A texture is placed when its memory is at most `heap size / divisor`.
pub const PLACED_HEAP_DIVISOR: u64 = 4;

pub const SRV_CBV_UAV_DESCRIPTOR_COUNT: u32 = 128;
pub const RTV_DESCRIPTOR_COUNT: u32 = 12;
pub const DSV_DESCRIPTOR_COUNT: u32 = 8;

pub const MSAA_SAMPLE_COUNT: u32 = 2;

/// Constant buffer slots created up front for every back buffer.
pub const PREALLOCATED_CONSTANT_BUFFERS: usize = 512;

/// Bytes per constant buffer slot: vertex constants at +0, pixel constants at +256.
pub const CONSTANT_BUFFER_SLOT_SIZE: u64 = 512;

pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
pub const CLEAR_DEPTH: f32 = 1.0;
pub const CLEAR_STENCIL: u8 = 0;

/// How many passes over the block list an allocation may make before the
/// buffer manager reports out-of-memory.
pub const OUT_OF_MEMORY_RETRY_LIMIT: usize = 15;

/// Upper bound on live upload buffers owned by the buffer manager.
pub const MAX_BUFFER_BLOCKS: usize = 64;

pub const FENCE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between window-size polls while the swapchain is unusable.
pub const SWAPCHAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMemoryConfig {
    pub allocation_size: u64,
    pub size_alignment: u64,
    pub out_of_memory_retry_limit: usize,
    pub max_blocks: usize,
}

impl Default for BufferMemoryConfig {
    fn default() -> Self {
        Self {
            allocation_size: BUFFER_ALLOCATION_SIZE,
            size_alignment: BUFFER_SIZE_ALIGNMENT,
            out_of_memory_retry_limit: OUT_OF_MEMORY_RETRY_LIMIT,
            max_blocks: MAX_BUFFER_BLOCKS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureMemoryConfig {
    pub heap_size: u64,
    pub placed_heap_divisor: u64,
    pub srv_descriptor_count: u32,
    pub rtv_descriptor_count: u32,
    pub dsv_descriptor_count: u32,
}

impl TextureMemoryConfig {
    /// Largest total size (mip chain included) that is still placed.
    pub fn size_limit_for_being_placed(&self) -> u64 {
        self.heap_size / self.placed_heap_divisor.max(1)
    }
}

impl Default for TextureMemoryConfig {
    fn default() -> Self {
        Self {
            heap_size: TEXTURE_HEAP_SIZE,
            placed_heap_divisor: PLACED_HEAP_DIVISOR,
            srv_descriptor_count: SRV_CBV_UAV_DESCRIPTOR_COUNT,
            rtv_descriptor_count: RTV_DESCRIPTOR_COUNT,
            dsv_descriptor_count: DSV_DESCRIPTOR_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendererConfig {
    pub backbuffer_count: u32,
    pub msaa_sample_count: u32,
    pub preallocated_constant_buffers: usize,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u8,
    pub fence_timeout: Duration,
    pub vsync: bool,
    pub validation: ValidationMode,
    pub buffers: BufferMemoryConfig,
    pub textures: TextureMemoryConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backbuffer_count: SWAPCHAIN_BACKBUFFER_COUNT,
            msaa_sample_count: MSAA_SAMPLE_COUNT,
            preallocated_constant_buffers: PREALLOCATED_CONSTANT_BUFFERS,
            clear_color: CLEAR_COLOR,
            clear_depth: CLEAR_DEPTH,
            clear_stencil: CLEAR_STENCIL,
            fence_timeout: FENCE_WAIT_TIMEOUT,
            vsync: true,
            validation: ValidationMode::default(),
            buffers: BufferMemoryConfig::default(),
            textures: TextureMemoryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_placed_limit_is_a_quarter_of_the_heap() {
        let config = TextureMemoryConfig::default();
        assert_eq!(config.size_limit_for_being_placed(), 1024 * 1024);
    }

    #[test]
    fn preallocated_constant_buffers_fit_in_one_upload_buffer() {
        let config = RendererConfig::default();
        let per_frame = config.preallocated_constant_buffers as u64 * CONSTANT_BUFFER_SLOT_SIZE;
        assert!(per_frame * config.backbuffer_count as u64 <= config.buffers.allocation_size);
    }
}
