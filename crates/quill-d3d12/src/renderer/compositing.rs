//! Layers, postprocess passes, filters and presenting to the back buffer.

use glam::{IVec2, Mat4, Vec2};

use super::draw::DrawGeometry;
use super::{BlendMode, Releasable, RenderInterface, VertexConstants};
use crate::device::{
    Command, CopyRegion, DescriptorHandle, Device, ResourceState, ScissorRect, TextureDesc,
    TextureFormat, TextureId, Viewport,
};
use crate::dictionary::Dictionary;
use crate::filter::{
    self, blur_weights, sigma_to_parameters, BlurConstants, ColorMatrixConstants, CompiledFilter,
    DropShadowConstants, MIN_BLUR_SIGMA,
};
use crate::handles::{CompiledFilterHandle, LayerHandle, TextureHandle};
use crate::layers::{FramebufferData, PostprocessSlot, SharedDepthStencil};
use crate::program::ProgramId;

/// One fullscreen draw between postprocess targets.
#[derive(Debug, Clone, Copy)]
struct PostprocessPass<'a> {
    program: ProgramId,
    sources: &'a [PostprocessSlot],
    pixel: &'a [u8],
    blend_factor: Option<[f32; 4]>,
    /// Target area; the whole target when `None`.
    viewport: Option<(u32, u32)>,
    clear: bool,
    texcoord_offset: Vec2,
    texcoord_scale: Vec2,
}

impl<'a> PostprocessPass<'a> {
    fn new(program: ProgramId, sources: &'a [PostprocessSlot]) -> Self {
        Self {
            program,
            sources,
            pixel: &[],
            blend_factor: None,
            viewport: None,
            clear: false,
            texcoord_offset: Vec2::ZERO,
            texcoord_scale: Vec2::ONE,
        }
    }

    fn pixel(mut self, pixel: &'a [u8]) -> Self {
        self.pixel = pixel;
        self
    }

    fn blend_factor(mut self, factor: [f32; 4]) -> Self {
        self.blend_factor = Some(factor);
        self
    }

    fn viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = Some((width, height));
        self
    }

    fn cleared(mut self) -> Self {
        self.clear = true;
        self
    }

    fn texcoords(mut self, offset: Vec2, scale: Vec2) -> Self {
        self.texcoord_offset = offset;
        self.texcoord_scale = scale;
        self
    }
}

impl<D: Device> RenderInterface<D> {
    /// Pushes a new layer, clears it to transparent and makes it the render target.
    pub fn push_layer(&mut self) -> Option<LayerHandle> {
        if !self.require_frame("push_layer") {
            return None;
        }
        let handle = match self.layers.push_layer(&mut self.device, &mut self.textures) {
            Ok(handle) => handle,
            Err(err) => {
                self.validator.fail("push_layer", err);
                return None;
            }
        };
        self.bind_layer(handle);
        self.clear_layer(handle, [0.0; 4]);
        Some(handle)
    }

    pub fn pop_layer(&mut self) {
        if !self.require_frame("pop_layer") {
            return;
        }
        if let Err(err) = self.layers.pop_layer() {
            self.validator.fail("pop_layer", err);
            return;
        }
        let top = self.layers.top_layer_handle();
        self.bind_layer(top);
    }

    /// Applies `filters` to `source` and composites the result onto
    /// `destination` with `blend_mode`.
    pub fn composite_layers(
        &mut self,
        source: LayerHandle,
        destination: LayerHandle,
        blend_mode: BlendMode,
        filters: &[CompiledFilterHandle],
    ) {
        if !self.require_frame("composite_layers") || self.suppress_if_scissor_invalid("composite_layers") {
            return;
        }
        if !self.resolve_layer_into(source, PostprocessSlot::Primary) {
            return;
        }
        self.apply_filters(filters);

        self.bind_layer(destination);
        let program = match blend_mode {
            BlendMode::Blend => ProgramId::PassthroughLayer,
            BlendMode::Replace => ProgramId::PassthroughLayerNoBlend,
        };
        if let Some(sources) = self.prepare_sources(&[PostprocessSlot::Primary]) {
            self.record(Command::SetBlendFactor([1.0; 4]));
            self.draw_fullscreen(program, &sources, &[], VertexConstants::new(Mat4::IDENTITY, Vec2::ZERO));
        }

        let top = self.layers.top_layer_handle();
        if destination != top {
            self.bind_layer(top);
        }
    }

    /// Copies the active layer, limited to the scissor region, into a new
    /// texture of `dimensions`.
    pub fn save_layer_as_texture(&mut self, dimensions: IVec2) -> Option<TextureHandle> {
        if !self.require_frame("save_layer_as_texture") {
            return None;
        }
        if dimensions.x <= 0 || dimensions.y <= 0 {
            tracing::error!(width = dimensions.x, height = dimensions.y, "saved layer has no area");
            return None;
        }
        let top = self.layers.top_layer_handle();
        if !self.resolve_layer_into(top, PostprocessSlot::Primary) {
            return None;
        }
        let (width, height) = (dimensions.x as u32, dimensions.y as u32);
        let bounds = self.current_scissor();
        let region = CopyRegion {
            x: bounds.left,
            y: bounds.top,
            width: bounds.width().min(width),
            height: bounds.height().min(height),
        };

        let desc = TextureDesc::texture_2d(width, height, TextureFormat::Rgba8Unorm);
        let texture = match self
            .textures
            .alloc_uninitialized_texture(&mut self.device, &desc, ResourceState::CopyDest)
        {
            Ok(texture) => texture,
            Err(err) => {
                self.validator.fail("save_layer_as_texture", err);
                self.bind_layer(top);
                return None;
            }
        };

        let primary = self.transition_postprocess(PostprocessSlot::Primary, ResourceState::CopySource);
        if let (Some(src), Some(dst)) = (primary, texture.texture_id()) {
            if texture.is_placed() {
                self.record(Command::AliasingBarrier {
                    before: None,
                    after: dst,
                });
            }
            self.record(Command::CopyTextureRegion {
                src,
                region,
                dst,
                dst_x: 0,
                dst_y: 0,
            });
            self.record(Command::TransitionBarrier {
                texture: dst,
                before: ResourceState::CopyDest,
                after: ResourceState::PixelShaderResource,
            });
        }
        self.bind_layer(top);
        Some(self.texture_table.insert(Releasable::new(texture)))
    }

    /// Renders the active layer into the blend mask target and returns a
    /// filter that masks by it.
    pub fn save_layer_as_mask_image(&mut self) -> Option<CompiledFilterHandle> {
        if !self.require_frame("save_layer_as_mask_image") {
            return None;
        }
        let top = self.layers.top_layer_handle();
        if !self.resolve_layer_into(top, PostprocessSlot::Primary) {
            return None;
        }
        self.postprocess(
            PostprocessSlot::BlendMask,
            PostprocessPass::new(ProgramId::PostprocessPassthroughNoBlend, &[PostprocessSlot::Primary]),
        );
        self.bind_layer(top);
        Some(self.filters.insert(CompiledFilter::MaskImage))
    }

    /// Compiles a named filter. Unknown names return `None`.
    pub fn compile_filter(&mut self, name: &str, parameters: &Dictionary) -> Option<CompiledFilterHandle> {
        match filter::compile_filter(name, parameters) {
            Some(compiled) => Some(self.filters.insert(compiled)),
            None => {
                tracing::warn!(name, "unsupported filter");
                None
            }
        }
    }

    pub fn release_filter(&mut self, filter: CompiledFilterHandle) {
        if self.filters.remove(filter.raw()).is_none() {
            tracing::warn!(%filter, "release of unknown filter");
        }
    }

    /// Makes `handle` the render target with the shared layer depth-stencil.
    pub(super) fn bind_layer(&mut self, handle: LayerHandle) {
        let depth_stencil = self
            .layers
            .depth_stencil(SharedDepthStencil::Layers)
            .and_then(FramebufferData::view);
        let Some(layer) = self.layers.layer_mut(handle) else {
            self.validator.fail("bind_layer", format!("{handle} is not an active layer"));
            return;
        };
        let barrier = layer.transition(ResourceState::RenderTarget);
        let view = layer.view();
        let (width, height) = layer.dimensions();

        if let Some(barrier) = barrier {
            self.record(barrier);
        }
        self.record(Command::SetRenderTargets {
            color: view,
            depth_stencil,
        });
        self.record(Command::SetViewport(Viewport::full(width, height)));
        let scissor = self.current_scissor();
        self.record(Command::SetScissor(scissor));
    }

    pub(super) fn clear_layer(&mut self, handle: LayerHandle, color: [f32; 4]) {
        let Some(layer) = self.layers.layer_mut(handle) else {
            return;
        };
        let barrier = layer.transition(ResourceState::RenderTarget);
        let Some(view) = layer.view() else {
            return;
        };
        if let Some(barrier) = barrier {
            self.record(barrier);
        }
        self.record(Command::ClearRenderTarget { view, color });
    }

    /// Resolves (or copies, without MSAA) `layer` into the postprocess target `slot`.
    pub(super) fn resolve_layer_into(&mut self, layer: LayerHandle, slot: PostprocessSlot) -> bool {
        if let Err(err) = self.layers.ensure_postprocess(&mut self.device, &mut self.textures, slot) {
            self.validator.fail("postprocess target", err);
            return false;
        }
        let Some(source) = self.layers.layer_mut(layer) else {
            self.validator.fail("resolve layer", format!("{layer} is not an active layer"));
            return false;
        };
        let multisampled = source.sample_count() > 1;
        let (src_state, dst_state) = if multisampled {
            (ResourceState::ResolveSource, ResourceState::ResolveDest)
        } else {
            (ResourceState::CopySource, ResourceState::CopyDest)
        };
        let src_barrier = source.transition(src_state);
        let (src, (width, height)) = (source.texture(), source.dimensions());

        let dst = self.transition_postprocess(slot, dst_state);
        let (Some(src), Some(dst)) = (src, dst) else {
            return false;
        };
        if let Some(barrier) = src_barrier {
            self.record(barrier);
        }
        if multisampled {
            self.record(Command::ResolveSubresource { src, dst });
        } else {
            self.record(Command::CopyTextureRegion {
                src,
                region: CopyRegion {
                    x: 0,
                    y: 0,
                    width,
                    height,
                },
                dst,
                dst_x: 0,
                dst_y: 0,
            });
        }
        true
    }

    /// Records the barrier moving postprocess `slot` into `state` and returns its texture.
    fn transition_postprocess(&mut self, slot: PostprocessSlot, state: ResourceState) -> Option<TextureId> {
        let framebuffer = self.layers.postprocess_mut(slot)?;
        let barrier = framebuffer.transition(state);
        let texture = framebuffer.texture();
        if let Some(barrier) = barrier {
            self.record(barrier);
        }
        texture
    }

    /// Moves `slots` into the shader-resource state and returns their SRVs.
    pub(super) fn prepare_sources(&mut self, slots: &[PostprocessSlot]) -> Option<Vec<DescriptorHandle>> {
        let mut sources = Vec::with_capacity(slots.len());
        for &slot in slots {
            if let Err(err) = self.layers.ensure_postprocess(&mut self.device, &mut self.textures, slot) {
                self.validator.fail("postprocess target", err);
                return None;
            }
            self.transition_postprocess(slot, ResourceState::PixelShaderResource);
            sources.push(self.layers.postprocess(slot).and_then(FramebufferData::srv)?);
        }
        Some(sources)
    }

    /// Draws the clip-space quad with `program`. The caller binds the target.
    fn draw_fullscreen(
        &mut self,
        program: ProgramId,
        sources: &[DescriptorHandle],
        pixel: &[u8],
        vertex: VertexConstants,
    ) {
        let Some(quad) = DrawGeometry::of(&self.fullscreen_quad) else {
            self.validator.fail("fullscreen quad", "fullscreen quad has no buffers");
            return;
        };
        self.draw_with(program, quad, &vertex, sources, pixel, None);
    }

    /// Runs `pass` into the postprocess target `target`.
    fn postprocess(&mut self, target: PostprocessSlot, pass: PostprocessPass<'_>) {
        let Some(sources) = self.prepare_sources(pass.sources) else {
            return;
        };
        if let Err(err) = self.layers.ensure_postprocess(&mut self.device, &mut self.textures, target) {
            self.validator.fail("postprocess target", err);
            return;
        }
        self.transition_postprocess(target, ResourceState::RenderTarget);
        let Some(framebuffer) = self.layers.postprocess(target) else {
            return;
        };
        let view = framebuffer.view();
        let (full_width, full_height) = framebuffer.dimensions();
        let (width, height) = pass.viewport.unwrap_or((full_width, full_height));

        self.record(Command::SetRenderTargets {
            color: view,
            depth_stencil: None,
        });
        self.record(Command::SetViewport(Viewport::full(width, height)));
        self.record(Command::SetScissor(ScissorRect::full(width, height)));
        if pass.clear {
            if let Some(view) = view {
                self.record(Command::ClearRenderTarget { view, color: [0.0; 4] });
            }
        }
        if let Some(factor) = pass.blend_factor {
            self.record(Command::SetBlendFactor(factor));
        }
        let vertex = VertexConstants::new(Mat4::IDENTITY, Vec2::ZERO)
            .with_texcoords(pass.texcoord_offset, pass.texcoord_scale);
        self.draw_fullscreen(pass.program, &sources, pass.pixel, vertex);
    }

    /// Applies `filters` in order to the primary postprocess target.
    fn apply_filters(&mut self, filters: &[CompiledFilterHandle]) {
        use PostprocessSlot::{BlendMask, Primary, Secondary, Tertiary};

        for &handle in filters {
            let Some(&filter) = self.filters.get(handle.raw()) else {
                self.validator.fail("apply_filters", format!("unknown {handle}"));
                continue;
            };
            match filter {
                CompiledFilter::Opacity { value } => {
                    self.postprocess(
                        Secondary,
                        PostprocessPass::new(ProgramId::PostprocessPassthrough, &[Primary])
                            .blend_factor([value; 4])
                            .cleared(),
                    );
                    self.layers.swap_postprocess_primary_secondary();
                }
                CompiledFilter::ColorMatrix(matrix) => {
                    let constants = ColorMatrixConstants {
                        matrix: matrix.to_cols_array(),
                    };
                    self.postprocess(
                        Secondary,
                        PostprocessPass::new(ProgramId::ColorMatrix, &[Primary]).pixel(bytemuck::bytes_of(&constants)),
                    );
                    self.layers.swap_postprocess_primary_secondary();
                }
                CompiledFilter::MaskImage => {
                    self.postprocess(Secondary, PostprocessPass::new(ProgramId::BlendMask, &[Primary, BlendMask]));
                    self.layers.swap_postprocess_primary_secondary();
                }
                CompiledFilter::Blur { sigma } => self.render_blur(sigma, Primary, Secondary),
                CompiledFilter::DropShadow { colour, offset, sigma } => {
                    let (width, height) = self.layers.dimensions();
                    let size = Vec2::new(width.max(1) as f32, height.max(1) as f32);
                    let constants = DropShadowConstants {
                        colour,
                        texcoord_min: [0.0; 2],
                        texcoord_max: [1.0; 2],
                    };
                    self.postprocess(
                        Tertiary,
                        PostprocessPass::new(ProgramId::DropShadow, &[Primary])
                            .pixel(bytemuck::bytes_of(&constants))
                            .texcoords(-offset / size, Vec2::ONE)
                            .cleared(),
                    );
                    self.render_blur(sigma, Tertiary, Secondary);
                    // The element itself goes over its shadow.
                    self.postprocess(
                        Tertiary,
                        PostprocessPass::new(ProgramId::PostprocessPassthrough, &[Primary]).blend_factor([1.0; 4]),
                    );
                    self.postprocess(
                        Primary,
                        PostprocessPass::new(ProgramId::PostprocessPassthroughNoBlend, &[Tertiary]),
                    );
                }
            }
        }
    }

    /// Gaussian blur of `target`, using `scratch` as the ping-pong buffer.
    ///
    /// Large sigmas are handled by halving the image until a single pass of
    /// the fixed kernel suffices, blurring vertically then horizontally at
    /// that size, and scaling back up.
    fn render_blur(&mut self, sigma: f32, target: PostprocessSlot, scratch: PostprocessSlot) {
        if sigma < MIN_BLUR_SIGMA {
            return;
        }
        let parameters = sigma_to_parameters(sigma);
        let (full_width, full_height) = self.layers.dimensions();
        if full_width == 0 || full_height == 0 {
            return;
        }
        let full = Vec2::new(full_width as f32, full_height as f32);

        let (mut src, mut dst) = (target, scratch);
        let mut size = (full_width, full_height);
        for _ in 0..parameters.pass_level {
            let next = ((size.0 / 2).max(1), (size.1 / 2).max(1));
            let scale = Vec2::new(size.0 as f32, size.1 as f32) / full;
            self.postprocess(
                dst,
                PostprocessPass::new(ProgramId::PostprocessPassthroughNoBlend, &[src])
                    .viewport(next.0, next.1)
                    .texcoords(Vec2::ZERO, scale),
            );
            size = next;
            std::mem::swap(&mut src, &mut dst);
        }

        let scale = Vec2::new(size.0 as f32, size.1 as f32) / full;
        let weights = blur_weights(parameters.sigma);
        let texel = Vec2::ONE / full;
        for direction in [Vec2::new(0.0, texel.y), Vec2::new(texel.x, 0.0)] {
            let constants = BlurConstants {
                texel_offset: direction.to_array(),
                texcoord_min: (texel * 0.5).to_array(),
                texcoord_max: (scale - texel * 0.5).to_array(),
                _pad: [0.0; 2],
                weights,
            };
            self.postprocess(
                dst,
                PostprocessPass::new(ProgramId::Blur, &[src])
                    .pixel(bytemuck::bytes_of(&constants))
                    .viewport(size.0, size.1)
                    .texcoords(Vec2::ZERO, scale),
            );
            std::mem::swap(&mut src, &mut dst);
        }

        if parameters.pass_level > 0 {
            self.postprocess(
                dst,
                PostprocessPass::new(ProgramId::PostprocessPassthroughNoBlend, &[src]).texcoords(Vec2::ZERO, scale),
            );
            std::mem::swap(&mut src, &mut dst);
        }
        if src != target {
            self.postprocess(
                target,
                PostprocessPass::new(ProgramId::PostprocessPassthroughNoBlend, &[src]),
            );
        }
    }

    /// Resolves the base layer and draws it onto the current back buffer,
    /// leaving the back buffer ready to present.
    pub(super) fn present_base_layer(&mut self) {
        let base = LayerHandle::from(0);
        if !self.resolve_layer_into(base, PostprocessSlot::Primary) {
            return;
        }
        let Some(sources) = self.prepare_sources(&[PostprocessSlot::Primary]) else {
            return;
        };

        let index = self.frame_index;
        let Some(back_buffer) = self
            .swapchain
            .as_mut()
            .and_then(|swapchain| swapchain.back_buffers.get_mut(index))
        else {
            self.validator.fail("end_frame", format!("no back buffer {index}"));
            return;
        };
        let texture = back_buffer.texture;
        let rtv = back_buffer.rtv.handle();
        let before = std::mem::replace(&mut back_buffer.state, ResourceState::Present);
        let (width, height) = self.viewport;

        if before != ResourceState::RenderTarget {
            self.record(Command::TransitionBarrier {
                texture,
                before,
                after: ResourceState::RenderTarget,
            });
        }
        self.record(Command::SetRenderTargets {
            color: Some(rtv),
            depth_stencil: None,
        });
        self.record(Command::SetViewport(Viewport::full(width, height)));
        self.record(Command::SetScissor(ScissorRect::full(width, height)));
        self.record(Command::ClearRenderTarget {
            view: rtv,
            color: self.config.clear_color,
        });
        self.record(Command::SetBlendFactor([1.0; 4]));
        self.draw_fullscreen(
            ProgramId::PostprocessPassthrough,
            &sources,
            &[],
            VertexConstants::new(Mat4::IDENTITY, Vec2::ZERO),
        );
        self.record(Command::TransitionBarrier {
            texture,
            before: ResourceState::RenderTarget,
            after: ResourceState::Present,
        });
    }
}
