use hashbrown::HashSet;

use super::{DebugMessageKind, DrawRecord, SoftDevice};
use crate::device::{
    Command, CopyRegion, DescriptorHandle, DescriptorHeapKind, PipelineStateId, QueueKind,
    ResourceState, ScissorRect, TextureId,
};

/// Pipeline state carried between the commands of one list.
#[derive(Debug)]
struct ExecState {
    pipeline: Option<PipelineStateId>,
    render_target: Option<DescriptorHandle>,
    depth_stencil: Option<DescriptorHandle>,
    scissor: Option<ScissorRect>,
    stencil_ref: u8,
    blend_factor: [f32; 4],
    vertex_buffer_bound: bool,
    index_buffer_bound: bool,
}

impl Default for ExecState {
    fn default() -> Self {
        Self {
            pipeline: None,
            render_target: None,
            depth_stencil: None,
            scissor: None,
            stencil_ref: 0,
            blend_factor: [1.0; 4],
            vertex_buffer_bound: false,
            index_buffer_bound: false,
        }
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

impl SoftDevice {
    pub(super) fn execute_commands(&mut self, kind: QueueKind, commands: &[Command]) {
        let mut state = ExecState::default();
        let mut touched = HashSet::new();

        for command in commands {
            touched.extend(command.textures());
            self.execute_command(command, &mut state);
        }

        // Resources used on a copy queue decay to COMMON once the work completes.
        if kind == QueueKind::Copy {
            for id in touched {
                if let Some(texture) = self.textures.get_mut(&id) {
                    texture.state = ResourceState::Common;
                }
            }
        }
    }

    fn execute_command(&mut self, command: &Command, state: &mut ExecState) {
        match command {
            Command::TransitionBarrier {
                texture,
                before,
                after,
            } => {
                let Some(current) = self.texture_in_use(*texture, "transition barrier") else {
                    return;
                };
                if current != *before {
                    self.message(
                        DebugMessageKind::BarrierStateMismatch,
                        format!(
                            "{texture} transition expects {before:?} but the resource is in {current:?}"
                        ),
                    );
                }
                if let Some(t) = self.textures.get_mut(texture) {
                    t.state = *after;
                }
            }
            Command::AliasingBarrier { after, .. } => match self.textures.get_mut(after) {
                Some(t) => t.awaiting_aliasing_barrier = false,
                None => self.message(
                    DebugMessageKind::UnknownObject,
                    format!("aliasing barrier names missing {after}"),
                ),
            },
            Command::SetDescriptorHeap(heap) => {
                if !self.descriptor_heaps.contains_key(heap) {
                    self.message(DebugMessageKind::UnknownObject, format!("{heap} is not alive"));
                }
            }
            Command::SetRootSignature(root_signature) => {
                if !self.root_signatures.contains_key(root_signature) {
                    self.message(
                        DebugMessageKind::UnknownObject,
                        format!("{root_signature} is not alive"),
                    );
                }
            }
            Command::SetPipelineState(pipeline) => {
                if self.pipelines.contains_key(pipeline) {
                    state.pipeline = Some(*pipeline);
                } else {
                    self.message(DebugMessageKind::UnknownObject, format!("{pipeline} is not alive"));
                }
            }
            Command::SetRootConstantBuffer { buffer, offset, .. } => {
                let in_range = self
                    .buffers
                    .get(buffer)
                    .is_some_and(|b| *offset < b.data.len() as u64);
                if !in_range {
                    self.message(
                        DebugMessageKind::UnknownObject,
                        format!("root CBV {buffer}+{offset} is not a live buffer range"),
                    );
                }
            }
            Command::SetRootDescriptorTable { descriptor, .. } => {
                if self.view_texture(*descriptor, DescriptorHeapKind::CbvSrvUav).is_none() {
                    self.message(
                        DebugMessageKind::InvalidView,
                        format!("descriptor table {descriptor:?} points at no live view"),
                    );
                }
            }
            Command::SetViewport(_) => {}
            Command::SetScissor(rect) => state.scissor = Some(*rect),
            Command::SetRenderTargets {
                color,
                depth_stencil,
            } => {
                state.render_target = *color;
                state.depth_stencil = *depth_stencil;
            }
            Command::ClearRenderTarget { view, color } => {
                let Some(texture) = self.view_texture(*view, DescriptorHeapKind::Rtv) else {
                    self.message(DebugMessageKind::InvalidView, format!("clear of dead RTV {view:?}"));
                    return;
                };
                self.expect_state(texture, ResourceState::RenderTarget, "clear render target");
                let pixel = color.map(unorm8);
                self.fill(texture, &pixel);
            }
            Command::ClearDepthStencil {
                view,
                depth,
                stencil,
            } => {
                let Some(texture) = self.view_texture(*view, DescriptorHeapKind::Dsv) else {
                    self.message(DebugMessageKind::InvalidView, format!("clear of dead DSV {view:?}"));
                    return;
                };
                self.expect_state(texture, ResourceState::DepthWrite, "clear depth stencil");
                let depth = (depth.clamp(0.0, 1.0) * 0x00ff_ffff as f32) as u32;
                let bytes = depth.to_le_bytes();
                self.fill(texture, &[bytes[0], bytes[1], bytes[2], *stencil]);
            }
            Command::SetStencilRef(value) => state.stencil_ref = *value,
            Command::SetBlendFactor(factor) => state.blend_factor = *factor,
            Command::SetVertexBuffer { buffer, .. } => {
                state.vertex_buffer_bound = self.buffers.contains_key(buffer);
                if !state.vertex_buffer_bound {
                    self.message(DebugMessageKind::UnknownObject, format!("vertex {buffer} is not alive"));
                }
            }
            Command::SetIndexBuffer { buffer, .. } => {
                state.index_buffer_bound = self.buffers.contains_key(buffer);
                if !state.index_buffer_bound {
                    self.message(DebugMessageKind::UnknownObject, format!("index {buffer} is not alive"));
                }
            }
            Command::DrawIndexed { index_count, .. } => self.draw(state, *index_count),
            Command::CopyBufferToTexture {
                src,
                footprint,
                dst,
            } => {
                let Some(current) = self.texture_in_use(*dst, "buffer to texture copy") else {
                    return;
                };
                if !matches!(current, ResourceState::CopyDest | ResourceState::Common) {
                    self.message(
                        DebugMessageKind::InvalidResourceState,
                        format!("{dst} is the destination of a copy in {current:?}"),
                    );
                }
                let Some(source) = self.buffers.get(src) else {
                    self.message(DebugMessageKind::UnknownObject, format!("copy source {src} is not alive"));
                    return;
                };
                let Some(texture) = self.textures.get_mut(dst) else {
                    return;
                };
                let row = footprint.row_size as usize;
                let rows = footprint.height.min(texture.desc.height) as usize;
                let dst_row = texture.desc.tight_row_bytes() as usize;
                let copy_row = row.min(dst_row);
                for y in 0..rows {
                    let src_start = (footprint.offset + footprint.row_pitch * y as u64) as usize;
                    let Some(src_row) = source.data.get(src_start..src_start + copy_row) else {
                        break;
                    };
                    texture.data[y * dst_row..y * dst_row + copy_row].copy_from_slice(src_row);
                }
            }
            Command::CopyTextureRegion {
                src,
                region,
                dst,
                dst_x,
                dst_y,
            } => {
                self.expect_state(*src, ResourceState::CopySource, "texture copy source");
                self.expect_state(*dst, ResourceState::CopyDest, "texture copy destination");
                self.texture_in_use(*dst, "texture copy destination");
                self.copy_region(*src, *region, *dst, *dst_x, *dst_y);
            }
            Command::ResolveSubresource { src, dst } => {
                self.expect_state(*src, ResourceState::ResolveSource, "resolve source");
                self.expect_state(*dst, ResourceState::ResolveDest, "resolve destination");
                self.resolve(*src, *dst);
            }
        }
    }

    /// Current state of a texture about to be used, flagging placed textures
    /// that were never activated with an aliasing barrier.
    fn texture_in_use(&mut self, id: TextureId, what: &str) -> Option<ResourceState> {
        let Some(texture) = self.textures.get(&id) else {
            self.message(
                DebugMessageKind::UnknownObject,
                format!("{what} uses destroyed {id}"),
            );
            return None;
        };
        let (state, awaiting) = (texture.state, texture.awaiting_aliasing_barrier);
        if awaiting {
            self.message(
                DebugMessageKind::MissingAliasingBarrier,
                format!("{what} uses placed {id} before an aliasing barrier"),
            );
        }
        Some(state)
    }

    fn expect_state(&mut self, id: TextureId, expected: ResourceState, what: &str) {
        match self.textures.get(&id).map(|t| t.state) {
            Some(state) if state == expected => {}
            Some(state) => self.message(
                DebugMessageKind::InvalidResourceState,
                format!("{what}: {id} is in {state:?}, expected {expected:?}"),
            ),
            None => self.message(
                DebugMessageKind::UnknownObject,
                format!("{what} uses destroyed {id}"),
            ),
        }
    }

    fn view_texture(&self, view: DescriptorHandle, kind: DescriptorHeapKind) -> Option<TextureId> {
        let heap = self.descriptor_heaps.get(&view.heap)?;
        if heap.kind != kind {
            return None;
        }
        let texture = *heap.views.get(&view.index)?;
        self.textures.contains_key(&texture).then_some(texture)
    }

    fn fill(&mut self, id: TextureId, pixel: &[u8; 4]) {
        if let Some(texture) = self.textures.get_mut(&id) {
            for chunk in texture.data.chunks_exact_mut(4) {
                chunk.copy_from_slice(pixel);
            }
        }
    }

    fn draw(&mut self, state: &ExecState, index_count: u32) {
        let Some(pipeline) = state.pipeline.and_then(|p| self.pipelines.get(&p).map(|d| (p, d.clone())))
        else {
            self.message(DebugMessageKind::InvalidResourceState, "draw without a pipeline state");
            return;
        };
        if !state.vertex_buffer_bound || !state.index_buffer_bound {
            self.message(
                DebugMessageKind::InvalidResourceState,
                format!("draw with '{}' without vertex and index buffers", pipeline.1.label),
            );
        }

        let render_target = state
            .render_target
            .and_then(|view| self.view_texture(view, DescriptorHeapKind::Rtv));
        if let Some(texture) = render_target {
            self.expect_state(texture, ResourceState::RenderTarget, "draw render target");
            let samples = self.textures.get(&texture).map(|t| t.desc.sample_count);
            if samples != Some(pipeline.1.sample_count) {
                self.message(
                    DebugMessageKind::InvalidResourceState,
                    format!(
                        "pipeline '{}' expects {} sample(s) but {texture} has {samples:?}",
                        pipeline.1.label, pipeline.1.sample_count
                    ),
                );
            }
        } else if pipeline.1.color_write {
            self.message(
                DebugMessageKind::InvalidView,
                format!("draw with '{}' has no live render target", pipeline.1.label),
            );
        }
        if let Some(texture) = state
            .depth_stencil
            .and_then(|view| self.view_texture(view, DescriptorHeapKind::Dsv))
        {
            self.expect_state(texture, ResourceState::DepthWrite, "draw depth stencil");
        }

        self.draws.push(DrawRecord {
            pipeline: pipeline.0,
            label: pipeline.1.label,
            shader: pipeline.1.shader,
            stencil: pipeline.1.stencil,
            stencil_ref: state.stencil_ref,
            render_target,
            scissor: state.scissor,
            index_count,
            blend_factor: state.blend_factor,
        });
    }

    fn copy_region(
        &mut self,
        src: TextureId,
        region: CopyRegion,
        dst: TextureId,
        dst_x: u32,
        dst_y: u32,
    ) {
        let Some((src_desc, src_data)) = self
            .textures
            .get(&src)
            .map(|t| (t.desc, t.data[..t.image_len()].to_vec()))
        else {
            return;
        };
        let Some(target) = self.textures.get_mut(&dst) else {
            return;
        };
        let fits_src = region.x + region.width <= src_desc.width && region.y + region.height <= src_desc.height;
        let fits_dst = dst_x + region.width <= target.desc.width && dst_y + region.height <= target.desc.height;
        if src_desc.sample_count != 1
            || target.desc.sample_count != 1
            || src_desc.format != target.desc.format
            || !fits_src
            || !fits_dst
        {
            let text = format!("invalid copy of {region:?} from {src} to {dst} at ({dst_x}, {dst_y})");
            self.message(DebugMessageKind::InvalidCopy, text);
            return;
        }

        let bpp = src_desc.format.bytes_per_pixel() as usize;
        let src_row = src_desc.width as usize * bpp;
        let dst_row = target.desc.width as usize * bpp;
        let span = region.width as usize * bpp;
        for y in 0..region.height as usize {
            let s = (region.y as usize + y) * src_row + region.x as usize * bpp;
            let d = (dst_y as usize + y) * dst_row + dst_x as usize * bpp;
            target.data[d..d + span].copy_from_slice(&src_data[s..s + span]);
        }
    }

    fn resolve(&mut self, src: TextureId, dst: TextureId) {
        let Some((src_desc, src_data)) = self.textures.get(&src).map(|t| (t.desc, t.data.clone())) else {
            return;
        };
        let Some(target) = self.textures.get_mut(&dst) else {
            return;
        };
        if target.desc.sample_count != 1
            || target.desc.width != src_desc.width
            || target.desc.height != src_desc.height
            || target.desc.format != src_desc.format
        {
            let text = format!("resolve from {src} into incompatible {dst}");
            self.message(DebugMessageKind::InvalidCopy, text);
            return;
        }

        let samples = src_desc.sample_count.max(1) as usize;
        let image = src_desc.base_memory() as usize;
        for (i, byte) in target.data.iter_mut().enumerate() {
            let sum: usize = (0..samples).map(|s| src_data[s * image + i] as usize).sum();
            *byte = ((sum + samples / 2) / samples) as u8;
        }
    }
}
