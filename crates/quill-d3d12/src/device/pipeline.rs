use super::{RootSignatureId, TextureFormat};

/// Root signature layout: root CBVs first, then one SRV table per texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSignatureDesc {
    pub constant_buffers: u32,
    pub texture_tables: u32,
}

impl RootSignatureDesc {
    pub fn parameter_count(&self) -> u32 {
        self.constant_buffers + self.texture_tables
    }

    /// Root parameter slot of the `index`th texture table.
    pub fn texture_slot(&self, index: u32) -> u32 {
        self.constant_buffers + index
    }
}

/// Vertex/pixel shader pair baked into a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderProgram {
    Color,
    Texture,
    Gradient,
    Creation,
    Passthrough,
    ColorMatrix,
    BlendMask,
    Blur,
    DropShadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendState {
    /// `src + dst * (1 - src.a)`.
    PremultipliedAlpha,
    /// `src * blend_factor + dst * (1 - src.a)`.
    ConstantFactor,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilState {
    Disabled,
    /// Passes when the stored value equals the reference.
    Equal,
    /// Always passes and writes the reference.
    Replace,
    /// Passes when equal to the reference and increments the stored value.
    Increment,
}

impl StencilState {
    pub fn writes_stencil(self) -> bool {
        matches!(self, StencilState::Replace | StencilState::Increment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineStateDesc {
    pub label: &'static str,
    pub root_signature: RootSignatureId,
    pub shader: ShaderProgram,
    pub blend: BlendState,
    pub stencil: StencilState,
    /// Stencil-only passes leave colour untouched.
    pub color_write: bool,
    pub color_format: TextureFormat,
    pub depth_stencil_format: Option<TextureFormat>,
    pub sample_count: u32,
}
