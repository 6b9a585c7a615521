//! quill's DirectX 12 render backend.
//!
//! The backend itself lives in [`d3d12`]; [`valloc`] is the device-independent
//! sub-allocator it carves upload buffers and texture heaps with.

pub use quill_d3d12 as d3d12;
pub use quill_valloc as valloc;

pub use quill_d3d12::{
    Backend, BlendMode, ClipMaskOperation, CompiledFilterHandle, CompiledGeometryHandle,
    CompiledShaderHandle, Dictionary, LayerHandle, Rectanglei, RenderError, RenderInterface,
    RendererConfig, TextureHandle, TextureSource, ValidationMode, Vertex, WindowSize,
};
