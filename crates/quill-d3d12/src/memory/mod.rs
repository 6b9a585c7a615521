//! GPU memory management: upload-heap buffers, textures and descriptors.

mod buffer;
mod descriptor;
mod texture;

pub use buffer::{
    BufferMemoryManager, BufferMemoryStatistics, ConstantBuffer, GeometryBuffers, GraphicsAllocation,
};
pub use descriptor::{SrvDescriptor, SrvDescriptorAllocator, ViewDescriptor, ViewDescriptorAllocator};
pub use texture::{
    total_memory_for_mip_chain, GpuTexture, TextureMemoryManager, TextureMemoryStatistics,
    TextureResource,
};
