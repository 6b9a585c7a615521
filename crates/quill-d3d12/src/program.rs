//! The fixed table of pipelines the renderer draws with.

use crate::device::{
    BlendState, Device, PipelineStateDesc, PipelineStateId, RootSignatureDesc, RootSignatureId,
    ShaderProgram, StencilState, TextureFormat,
};
use crate::error::DeviceError;

/// Root parameter slot of the per-draw vertex constants.
pub const VERTEX_CONSTANTS_SLOT: u32 = 0;
/// Root parameter slot of the per-draw pixel constants.
pub const PIXEL_CONSTANTS_SLOT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramId {
    ColorStencilAlways,
    ColorStencilEqual,
    ColorStencilSet,
    ColorStencilSetInverse,
    ColorStencilIntersect,
    TextureStencilAlways,
    TextureStencilEqual,
    GradientStencilAlways,
    GradientStencilEqual,
    CreationStencilAlways,
    CreationStencilEqual,
    PassthroughLayer,
    PassthroughLayerNoBlend,
    PostprocessPassthrough,
    PostprocessPassthroughNoBlend,
    ColorMatrix,
    BlendMask,
    Blur,
    DropShadow,
}

const _: () = assert!(ProgramId::DropShadow as usize + 1 == ProgramId::COUNT);

impl ProgramId {
    pub const COUNT: usize = 19;

    pub const ALL: [ProgramId; ProgramId::COUNT] = [
        ProgramId::ColorStencilAlways,
        ProgramId::ColorStencilEqual,
        ProgramId::ColorStencilSet,
        ProgramId::ColorStencilSetInverse,
        ProgramId::ColorStencilIntersect,
        ProgramId::TextureStencilAlways,
        ProgramId::TextureStencilEqual,
        ProgramId::GradientStencilAlways,
        ProgramId::GradientStencilEqual,
        ProgramId::CreationStencilAlways,
        ProgramId::CreationStencilEqual,
        ProgramId::PassthroughLayer,
        ProgramId::PassthroughLayerNoBlend,
        ProgramId::PostprocessPassthrough,
        ProgramId::PostprocessPassthroughNoBlend,
        ProgramId::ColorMatrix,
        ProgramId::BlendMask,
        ProgramId::Blur,
        ProgramId::DropShadow,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            ProgramId::ColorStencilAlways => "color-stencil-always",
            ProgramId::ColorStencilEqual => "color-stencil-equal",
            ProgramId::ColorStencilSet => "color-stencil-set",
            ProgramId::ColorStencilSetInverse => "color-stencil-set-inverse",
            ProgramId::ColorStencilIntersect => "color-stencil-intersect",
            ProgramId::TextureStencilAlways => "texture-stencil-always",
            ProgramId::TextureStencilEqual => "texture-stencil-equal",
            ProgramId::GradientStencilAlways => "gradient-stencil-always",
            ProgramId::GradientStencilEqual => "gradient-stencil-equal",
            ProgramId::CreationStencilAlways => "creation-stencil-always",
            ProgramId::CreationStencilEqual => "creation-stencil-equal",
            ProgramId::PassthroughLayer => "passthrough-layer",
            ProgramId::PassthroughLayerNoBlend => "passthrough-layer-no-blend",
            ProgramId::PostprocessPassthrough => "postprocess-passthrough",
            ProgramId::PostprocessPassthroughNoBlend => "postprocess-passthrough-no-blend",
            ProgramId::ColorMatrix => "color-matrix",
            ProgramId::BlendMask => "blend-mask",
            ProgramId::Blur => "blur",
            ProgramId::DropShadow => "drop-shadow",
        }
    }

    pub fn shader(self) -> ShaderProgram {
        use ProgramId::*;
        match self {
            ColorStencilAlways | ColorStencilEqual | ColorStencilSet | ColorStencilSetInverse
            | ColorStencilIntersect => ShaderProgram::Color,
            TextureStencilAlways | TextureStencilEqual => ShaderProgram::Texture,
            GradientStencilAlways | GradientStencilEqual => ShaderProgram::Gradient,
            CreationStencilAlways | CreationStencilEqual => ShaderProgram::Creation,
            PassthroughLayer | PassthroughLayerNoBlend | PostprocessPassthrough
            | PostprocessPassthroughNoBlend => ShaderProgram::Passthrough,
            ColorMatrix => ShaderProgram::ColorMatrix,
            BlendMask => ShaderProgram::BlendMask,
            Blur => ShaderProgram::Blur,
            DropShadow => ShaderProgram::DropShadow,
        }
    }

    pub fn stencil(self) -> StencilState {
        use ProgramId::*;
        match self {
            ColorStencilEqual | TextureStencilEqual | GradientStencilEqual | CreationStencilEqual => {
                StencilState::Equal
            }
            ColorStencilSet | ColorStencilSetInverse => StencilState::Replace,
            ColorStencilIntersect => StencilState::Increment,
            _ => StencilState::Disabled,
        }
    }

    pub fn blend(self) -> BlendState {
        use ProgramId::*;
        match self {
            PassthroughLayer | PostprocessPassthrough => BlendState::ConstantFactor,
            PassthroughLayerNoBlend | PostprocessPassthroughNoBlend | ColorMatrix | BlendMask | Blur
            | DropShadow => BlendState::Replace,
            _ => BlendState::PremultipliedAlpha,
        }
    }

    /// Programs that draw into the multisampled layer framebuffers, as
    /// opposed to the single-sampled postprocess targets and back buffer.
    pub fn targets_layer(self) -> bool {
        use ProgramId::*;
        !matches!(
            self,
            PostprocessPassthrough | PostprocessPassthroughNoBlend | ColorMatrix | BlendMask | Blur | DropShadow
        )
    }

    /// Number of SRV tables bound after the two constant buffers.
    pub fn texture_count(self) -> u32 {
        match self.shader() {
            ShaderProgram::Color | ShaderProgram::Gradient | ShaderProgram::Creation => 0,
            ShaderProgram::BlendMask => 2,
            _ => 1,
        }
    }

    pub fn root_signature_desc(self) -> RootSignatureDesc {
        RootSignatureDesc {
            constant_buffers: 2,
            texture_tables: self.texture_count(),
        }
    }

    pub fn pipeline_desc(self, root_signature: RootSignatureId, msaa_sample_count: u32) -> PipelineStateDesc {
        let layer = self.targets_layer();
        PipelineStateDesc {
            label: self.label(),
            root_signature,
            shader: self.shader(),
            blend: self.blend(),
            stencil: self.stencil(),
            color_write: !matches!(
                self,
                ProgramId::ColorStencilSet | ProgramId::ColorStencilSetInverse | ProgramId::ColorStencilIntersect
            ),
            color_format: TextureFormat::Rgba8Unorm,
            depth_stencil_format: layer.then_some(TextureFormat::D24UnormS8Uint),
            sample_count: if layer { msaa_sample_count } else { 1 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineEntry {
    pub root_signature: RootSignatureId,
    pub pipeline: PipelineStateId,
    pub layout: RootSignatureDesc,
}

/// Root signature and pipeline state per [`ProgramId`], created once at
/// initialisation and destroyed at shutdown.
#[derive(Debug, Default)]
pub struct PipelineTable {
    entries: Vec<PipelineEntry>,
}

impl PipelineTable {
    pub fn new<D: Device>(device: &mut D, msaa_sample_count: u32) -> Result<Self, DeviceError> {
        let mut table = PipelineTable {
            entries: Vec::with_capacity(ProgramId::COUNT),
        };
        for program in ProgramId::ALL {
            match Self::create_entry(device, program, msaa_sample_count) {
                Ok(entry) => table.entries.push(entry),
                Err(err) => {
                    tracing::error!(program = program.label(), %err, "pipeline creation failed");
                    table.destroy(device);
                    return Err(err);
                }
            }
        }
        assert_eq!(table.entries.len(), ProgramId::COUNT, "one pipeline per program");
        Ok(table)
    }

    fn create_entry<D: Device>(
        device: &mut D,
        program: ProgramId,
        msaa_sample_count: u32,
    ) -> Result<PipelineEntry, DeviceError> {
        let layout = program.root_signature_desc();
        let root_signature = device.create_root_signature(&layout)?;
        match device.create_pipeline_state(&program.pipeline_desc(root_signature, msaa_sample_count)) {
            Ok(pipeline) => Ok(PipelineEntry {
                root_signature,
                pipeline,
                layout,
            }),
            Err(err) => {
                device.destroy_root_signature(root_signature);
                Err(err)
            }
        }
    }

    pub fn get(&self, program: ProgramId) -> Option<&PipelineEntry> {
        self.entries.get(program.index())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn destroy<D: Device>(&mut self, device: &mut D) {
        for entry in self.entries.drain(..) {
            device.destroy_pipeline_state(entry.pipeline);
            device.destroy_root_signature(entry.root_signature);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftDevice;

    #[test]
    fn every_program_has_its_own_slot() {
        for (index, program) in ProgramId::ALL.iter().enumerate() {
            assert_eq!(program.index(), index);
        }
    }

    #[test]
    fn table_creates_and_destroys_all_pipelines() {
        let mut device = SoftDevice::new();
        let mut table = PipelineTable::new(&mut device, 2).unwrap();
        assert_eq!(table.len(), ProgramId::COUNT);
        assert_eq!(device.live_pipeline_count(), ProgramId::COUNT);
        assert_eq!(device.live_root_signature_count(), ProgramId::COUNT);

        let blur = table.get(ProgramId::Blur).unwrap();
        assert_eq!(blur.layout.texture_slot(0), 2);

        table.destroy(&mut device);
        assert_eq!(device.live_pipeline_count(), 0);
        assert_eq!(device.live_root_signature_count(), 0);
    }

    #[test]
    fn postprocess_programs_are_single_sampled() {
        let root = RootSignatureId(1);
        assert_eq!(ProgramId::Blur.pipeline_desc(root, 4).sample_count, 1);
        assert_eq!(ProgramId::Blur.pipeline_desc(root, 4).depth_stencil_format, None);
        assert_eq!(ProgramId::ColorStencilEqual.pipeline_desc(root, 4).sample_count, 4);
        assert!(!ProgramId::ColorStencilIntersect.pipeline_desc(root, 4).color_write);
    }
}
