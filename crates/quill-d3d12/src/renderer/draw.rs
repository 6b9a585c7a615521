//! Geometry, textures, scissor, clip mask and shader draws into the active layer.

use std::path::Path;

use glam::{IVec2, Mat4, Vec2};

use super::{
    ClipMaskOperation, Releasable, RenderInterface, Retired, TextureSource, VertexConstants,
    PIXEL_CONSTANTS_OFFSET,
};
use crate::config::CONSTANT_BUFFER_SLOT_SIZE;
use crate::device::{
    BufferId, Command, DescriptorHandle, Device, ScissorRect, StencilState, TextureDesc,
    TextureFormat, TextureId,
};
use crate::dictionary::Dictionary;
use crate::error::AllocError;
use crate::geometry::{Rectanglei, Vertex};
use crate::handles::{CompiledGeometryHandle, CompiledShaderHandle, TextureHandle};
use crate::layers::PostprocessSlot;
use crate::memory::{ConstantBuffer, GeometryBuffers};
use crate::program::{PipelineEntry, ProgramId, PIXEL_CONSTANTS_SLOT, VERTEX_CONSTANTS_SLOT};
use crate::shader::{self, CompiledShader, CreationConstants};
use crate::tga;

/// Vertex and index buffer views of a compiled geometry.
#[derive(Debug, Clone, Copy)]
pub(super) struct DrawGeometry {
    vertex_buffer: BufferId,
    vertex_offset: u64,
    vertex_size: u64,
    vertex_stride: u32,
    index_buffer: BufferId,
    index_offset: u64,
    index_size: u64,
    index_count: u32,
}

impl DrawGeometry {
    pub(super) fn of(geometry: &GeometryBuffers) -> Option<Self> {
        let (vertex, index) = (geometry.vertex()?, geometry.index()?);
        Some(Self {
            vertex_buffer: vertex.buffer(),
            vertex_offset: vertex.offset(),
            vertex_size: vertex.size(),
            vertex_stride: geometry.vertex_stride(),
            index_buffer: index.buffer(),
            index_offset: index.offset(),
            index_size: index.size(),
            index_count: geometry.index_count(),
        })
    }
}

impl<D: Device> RenderInterface<D> {
    /// Uploads `vertices` and `indices` into the shared upload buffers.
    pub fn compile_geometry(&mut self, vertices: &[Vertex], indices: &[u32]) -> Option<CompiledGeometryHandle> {
        let mut geometry = GeometryBuffers::default();
        let result = match self.buffers.alloc_vertex(&mut self.device, &mut geometry, vertices) {
            Ok(()) => self.buffers.alloc_index(&mut self.device, &mut geometry, indices),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            if let Err(free_err) = self.buffers.free_geometry(&mut geometry) {
                tracing::error!(%free_err, "freeing partially compiled geometry failed");
            }
            self.validator.fail("compile_geometry", err);
            return None;
        }
        Some(self.geometries.insert(Releasable::new(geometry)))
    }

    /// Draws `geometry` offset by `translation` into the active layer,
    /// optionally sampling `texture`.
    pub fn render_geometry(
        &mut self,
        geometry: CompiledGeometryHandle,
        translation: Vec2,
        texture: Option<TextureSource>,
    ) {
        if !self.require_frame("render_geometry") || self.suppress_if_scissor_invalid("render_geometry") {
            return;
        }
        let srv = match texture {
            Some(source) => match self.resolve_texture_source(source) {
                Some(srv) => Some(srv),
                None => return,
            },
            None => None,
        };
        let (always, equal) = match srv {
            Some(_) => (ProgramId::TextureStencilAlways, ProgramId::TextureStencilEqual),
            None => (ProgramId::ColorStencilAlways, ProgramId::ColorStencilEqual),
        };
        let program = self.masked_program(always, equal);
        let textures: Vec<DescriptorHandle> = srv.into_iter().collect();
        self.draw_geometry(program, geometry, translation, &textures, &[], None);
    }

    /// Queues `geometry` for release. It stays drawable until the frame that
    /// released it has completed on the GPU.
    pub fn release_geometry(&mut self, geometry: CompiledGeometryHandle) {
        match self.geometries.get_mut(geometry.raw()) {
            Some(entry) if !entry.released => {
                entry.released = true;
                self.defer_release(Retired::Geometry(geometry.raw()));
            }
            Some(_) => tracing::warn!(%geometry, "geometry released twice"),
            None => tracing::warn!(%geometry, "release of unknown geometry"),
        }
    }

    /// Loads an uncompressed TGA file. Failures are logged and return `None`.
    pub fn load_texture(&mut self, path: &Path) -> Option<(TextureHandle, IVec2)> {
        let image = match tga::load(path) {
            Ok(image) => image,
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "could not load texture");
                return None;
            }
        };
        let dimensions = IVec2::new(image.width as i32, image.height as i32);
        let handle = self.generate_texture(&image.pixels, dimensions)?;
        Some((handle, dimensions))
    }

    /// Creates a texture from tightly packed premultiplied RGBA8 pixels.
    pub fn generate_texture(&mut self, pixels: &[u8], dimensions: IVec2) -> Option<TextureHandle> {
        if dimensions.x <= 0 || dimensions.y <= 0 {
            tracing::error!(width = dimensions.x, height = dimensions.y, "texture has no area");
            return None;
        }
        let desc = TextureDesc::texture_2d(dimensions.x as u32, dimensions.y as u32, TextureFormat::Rgba8Unorm);
        match self.textures.alloc_texture(&mut self.device, &desc, pixels) {
            Ok(texture) => Some(self.texture_table.insert(Releasable::new(texture))),
            Err(err @ AllocError::PixelDataSize { .. }) => {
                tracing::error!(%err, "texture data does not match its dimensions");
                None
            }
            Err(err) => {
                self.validator.fail("generate_texture", err);
                None
            }
        }
    }

    /// Queues `texture` for release, like [`RenderInterface::release_geometry`].
    pub fn release_texture(&mut self, texture: TextureHandle) {
        match self.texture_table.get_mut(texture.raw()) {
            Some(entry) if !entry.released => {
                entry.released = true;
                self.defer_release(Retired::Texture(texture.raw()));
            }
            Some(_) => tracing::warn!(%texture, "texture released twice"),
            None => tracing::warn!(%texture, "release of unknown texture"),
        }
    }

    /// Device texture behind `texture`, while it is alive.
    pub fn texture_id(&self, texture: TextureHandle) -> Option<TextureId> {
        self.texture_table.get(texture.raw())?.value.texture_id()
    }

    pub fn texture_dimensions(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.texture_table.get(texture.raw()).map(|entry| entry.value.dimensions())
    }

    /// Transform applied before the projection to every following draw.
    pub fn set_transform(&mut self, transform: Option<Mat4>) {
        self.frame.transform = transform;
    }

    pub fn enable_scissor_region(&mut self, enable: bool) {
        self.frame.scissor_enabled = enable;
        if !enable {
            self.frame.scissor_invalid = false;
        }
        if self.frame.in_frame {
            let scissor = self.current_scissor();
            self.record(Command::SetScissor(scissor));
        }
    }

    /// A region with no area puts the renderer in an invalid state that
    /// skips draws until a usable region is set.
    pub fn set_scissor_region(&mut self, region: Rectanglei) {
        self.frame.scissor = region;
        if !self.frame.scissor_enabled {
            return;
        }
        let (width, height) = self.layers.dimensions();
        let scissor = region.to_scissor(width, height);
        if region.is_empty() || scissor.is_empty() {
            if !self.frame.scissor_invalid && cfg!(debug_assertions) {
                tracing::warn!(?region, "degenerate scissor region; draws are skipped until it is valid");
            }
            self.frame.scissor_invalid = true;
            return;
        }
        self.frame.scissor_invalid = false;
        if self.frame.in_frame {
            self.record(Command::SetScissor(scissor));
        }
    }

    pub(super) fn current_scissor(&self) -> ScissorRect {
        let (width, height) = self.layers.dimensions();
        if self.frame.scissor_enabled && !self.frame.scissor_invalid {
            self.frame.scissor.to_scissor(width, height)
        } else {
            ScissorRect::full(width, height)
        }
    }

    /// Counts and skips a draw while the scissor region is degenerate.
    pub(super) fn suppress_if_scissor_invalid(&self, operation: &str) -> bool {
        if !self.frame.scissor_invalid {
            return false;
        }
        self.stats.inc_draw_calls_suppressed();
        if cfg!(debug_assertions) {
            tracing::warn!(operation, "draw skipped: scissor region is degenerate");
        }
        true
    }

    /// Following draws only touch pixels inside the clip mask.
    pub fn enable_clip_mask(&mut self, enable: bool) {
        self.frame.clip_mask_enabled = enable;
    }

    /// Updates the clip mask in the stencil buffer with `geometry`.
    pub fn render_to_clip_mask(
        &mut self,
        operation: ClipMaskOperation,
        geometry: CompiledGeometryHandle,
        translation: Vec2,
    ) {
        if !self.require_frame("render_to_clip_mask") || self.suppress_if_scissor_invalid("render_to_clip_mask") {
            return;
        }
        let (program, stencil_ref) = match operation {
            ClipMaskOperation::Set => {
                self.clear_stencil(0);
                self.frame.stencil_test_value = 1;
                (ProgramId::ColorStencilSet, 1)
            }
            ClipMaskOperation::SetInverse => {
                self.clear_stencil(1);
                self.frame.stencil_test_value = 1;
                (ProgramId::ColorStencilSetInverse, 0)
            }
            ClipMaskOperation::Intersect => {
                let reference = self.frame.stencil_test_value;
                self.frame.stencil_test_value = reference.wrapping_add(1);
                (ProgramId::ColorStencilIntersect, reference)
            }
        };
        self.draw_geometry(program, geometry, translation, &[], &[], Some(stencil_ref));
    }

    fn clear_stencil(&mut self, stencil: u8) {
        let view = self
            .layers
            .depth_stencil(crate::layers::SharedDepthStencil::Layers)
            .and_then(|ds| ds.view());
        match view {
            Some(view) => self.record(Command::ClearDepthStencil {
                view,
                depth: self.config.clear_depth,
                stencil,
            }),
            None => self.validator.fail("clip mask", "layer depth-stencil is missing"),
        }
    }

    /// Compiles a gradient or the "creation" shader. Unknown names return `None`.
    pub fn compile_shader(&mut self, name: &str, parameters: &Dictionary) -> Option<CompiledShaderHandle> {
        match shader::compile_shader(name, parameters) {
            Some(compiled) => Some(self.shaders.insert(compiled)),
            None => {
                tracing::warn!(name, "unsupported shader");
                None
            }
        }
    }

    pub fn render_shader(&mut self, shader: CompiledShaderHandle, geometry: CompiledGeometryHandle, translation: Vec2) {
        if !self.require_frame("render_shader") || self.suppress_if_scissor_invalid("render_shader") {
            return;
        }
        let Some(compiled) = self.shaders.get(shader.raw()) else {
            self.validator.fail("render_shader", format!("unknown {shader}"));
            return;
        };
        let (always, equal, pixel) = match compiled {
            CompiledShader::Gradient { .. } => {
                let Some(constants) = compiled.gradient_constants() else {
                    return;
                };
                (
                    ProgramId::GradientStencilAlways,
                    ProgramId::GradientStencilEqual,
                    bytemuck::bytes_of(&constants).to_vec(),
                )
            }
            CompiledShader::Creation { dimensions } => {
                let constants = CreationConstants {
                    dimensions: dimensions.to_array(),
                    _pad: [0.0; 2],
                };
                (
                    ProgramId::CreationStencilAlways,
                    ProgramId::CreationStencilEqual,
                    bytemuck::bytes_of(&constants).to_vec(),
                )
            }
        };
        let program = self.masked_program(always, equal);
        self.draw_geometry(program, geometry, translation, &[], &pixel, None);
    }

    pub fn release_shader(&mut self, shader: CompiledShaderHandle) {
        if self.shaders.remove(shader.raw()).is_none() {
            tracing::warn!(%shader, "release of unknown shader");
        }
    }

    fn masked_program(&self, always: ProgramId, equal: ProgramId) -> ProgramId {
        if self.frame.clip_mask_enabled {
            equal
        } else {
            always
        }
    }

    /// SRV for `source`. Layers are resolved into the primary postprocess
    /// target first.
    fn resolve_texture_source(&mut self, source: TextureSource) -> Option<DescriptorHandle> {
        match source {
            TextureSource::Texture(texture) => {
                let srv = self.texture_table.get(texture.raw()).and_then(|entry| entry.value.srv());
                if srv.is_none() {
                    self.validator.fail("render_geometry", format!("unknown {texture}"));
                }
                srv
            }
            TextureSource::Layer(layer) => {
                if !self.resolve_layer_into(layer, PostprocessSlot::Primary) {
                    return None;
                }
                let top = self.layers.top_layer_handle();
                self.bind_layer(top);
                self.prepare_sources(&[PostprocessSlot::Primary])?.into_iter().next()
            }
        }
    }

    /// Binds `program`, unless it is already bound.
    pub(super) fn use_program(&mut self, program: ProgramId) -> Option<PipelineEntry> {
        let Some(entry) = self.pipelines.get(program).copied() else {
            self.validator.fail("use_program", format!("no pipeline for {}", program.label()));
            return None;
        };
        if self.frame.program != Some(program) {
            if self.frame.root_signature != Some(entry.root_signature) {
                self.record(Command::SetRootSignature(entry.root_signature));
                self.frame.root_signature = Some(entry.root_signature);
            }
            self.record(Command::SetPipelineState(entry.pipeline));
            self.frame.program = Some(program);
        }
        Some(entry)
    }

    /// Writes the next constant buffer slot of the frame and binds it.
    pub(super) fn bind_constants(&mut self, vertex: &VertexConstants, pixel: &[u8]) -> bool {
        let resources = &mut self.frames[self.frame_index];
        if resources.used_constant_buffers == resources.constant_buffers.len() {
            let mut constant_buffer = ConstantBuffer::default();
            if let Err(err) =
                self.buffers
                    .alloc_constant_buffer(&mut self.device, &mut constant_buffer, CONSTANT_BUFFER_SLOT_SIZE)
            {
                self.validator.fail("constant buffer", err);
                return false;
            }
            tracing::trace!(
                count = resources.constant_buffers.len() + 1,
                "constant buffer pool grown"
            );
            resources.constant_buffers.push(constant_buffer);
        }
        let Some(allocation) = resources.constant_buffers[resources.used_constant_buffers].allocation() else {
            self.validator.fail("constant buffer", "pooled constant buffer has no allocation");
            return false;
        };
        resources.used_constant_buffers += 1;

        let (buffer, offset) = (allocation.buffer(), allocation.offset());
        let mut written = self.buffers.write_pod(&mut self.device, allocation, 0, vertex);
        if written.is_ok() && !pixel.is_empty() {
            written = self.buffers.write(&mut self.device, allocation, PIXEL_CONSTANTS_OFFSET, pixel);
        }
        if let Err(err) = written {
            self.validator.fail("constant buffer", err);
            return false;
        }

        self.record(Command::SetRootConstantBuffer {
            slot: VERTEX_CONSTANTS_SLOT,
            buffer,
            offset,
        });
        self.record(Command::SetRootConstantBuffer {
            slot: PIXEL_CONSTANTS_SLOT,
            buffer,
            offset: offset + PIXEL_CONSTANTS_OFFSET,
        });
        true
    }

    /// Binds `program` with its constants and textures and draws `geometry`.
    pub(super) fn draw_with(
        &mut self,
        program: ProgramId,
        geometry: DrawGeometry,
        vertex: &VertexConstants,
        textures: &[DescriptorHandle],
        pixel: &[u8],
        stencil_ref: Option<u8>,
    ) {
        let Some(entry) = self.use_program(program) else {
            return;
        };
        if !self.bind_constants(vertex, pixel) {
            return;
        }
        for (index, &descriptor) in textures.iter().enumerate() {
            self.record(Command::SetRootDescriptorTable {
                slot: entry.layout.texture_slot(index as u32),
                descriptor,
            });
        }
        if program.stencil() != StencilState::Disabled {
            let reference = stencil_ref.unwrap_or(self.frame.stencil_test_value);
            self.record(Command::SetStencilRef(reference));
        }
        self.record(Command::SetVertexBuffer {
            buffer: geometry.vertex_buffer,
            offset: geometry.vertex_offset,
            size: geometry.vertex_size,
            stride: geometry.vertex_stride,
        });
        self.record(Command::SetIndexBuffer {
            buffer: geometry.index_buffer,
            offset: geometry.index_offset,
            size: geometry.index_size,
        });
        self.record(Command::DrawIndexed {
            index_count: geometry.index_count,
            start_index: 0,
            base_vertex: 0,
        });
        self.stats.inc_draw_calls_submitted();
    }

    fn draw_geometry(
        &mut self,
        program: ProgramId,
        geometry: CompiledGeometryHandle,
        translation: Vec2,
        textures: &[DescriptorHandle],
        pixel: &[u8],
        stencil_ref: Option<u8>,
    ) {
        let Some(view) = self
            .geometries
            .get(geometry.raw())
            .and_then(|entry| DrawGeometry::of(&entry.value))
        else {
            self.validator.fail("draw", format!("unknown {geometry}"));
            return;
        };
        let transform = self.projection * self.frame.transform.unwrap_or(Mat4::IDENTITY);
        let vertex = VertexConstants::new(transform, translation);
        self.draw_with(program, view, &vertex, textures, pixel, stencil_ref);
    }
}
