//! `quill-d3d12` is the DirectX 12 render backend of the quill UI toolkit.
//!
//! The crate is organised around a D3D12-shaped device seam ([`device::Device`])
//! so that all of the memory and frame management logic is independent of the
//! COM wrappers that talk to the driver:
//! - [`memory::BufferMemoryManager`] sub-allocates vertex, index and constant
//!   data from a few large persistently mapped upload buffers.
//! - [`memory::TextureMemoryManager`] picks placed vs. committed resources,
//!   uploads pixels through a copy queue and owns descriptor sub-allocation.
//! - [`RenderLayerStack`] keeps the offscreen layer and postprocess
//!   framebuffers.
//! - [`RenderInterface`] drives a frame: command lists, fence pacing,
//!   pipelines, geometry, clip masks, filters and shaders.
//!
//! [`soft::SoftDevice`] is a CPU reference device that validates usage the
//! way the D3D12 debug layer would; every portable test in the workspace runs
//! on it. On Windows, `d3d12::D3D12Device` drives the real API.

pub mod backend;
pub mod config;
#[cfg(windows)]
pub mod d3d12;
pub mod device;
pub mod memory;
pub mod soft;
pub mod stats;
pub mod tga;

mod dictionary;
mod error;
mod filter;
mod geometry;
mod handles;
mod layers;
mod program;
mod renderer;
mod shader;
mod validation;

pub use backend::{Backend, WindowSize};
pub use config::{BufferMemoryConfig, RendererConfig, TextureMemoryConfig};
pub use dictionary::{ColorStop, Dictionary, Variant};
pub use error::{AllocError, DeviceError, OutOfMemoryError, RenderError};
pub use filter::{blur_weights, sigma_to_parameters, BlurParameters, CompiledFilter};
pub use geometry::{quad, Rectanglei, Vertex};
pub use handles::{
    CompiledFilterHandle, CompiledGeometryHandle, CompiledShaderHandle, LayerHandle,
    TextureHandle,
};
pub use layers::{FramebufferData, PostprocessSlot, RenderLayerStack, SharedDepthStencil};
pub use program::{PipelineTable, ProgramId};
pub use renderer::{BlendMode, ClipMaskOperation, RenderInterface, TextureSource};
pub use shader::{CompiledShader, GradientFunction, MAX_GRADIENT_STOPS};
pub use validation::{ValidationMode, Validator};
