use super::{
    BufferId, DescriptorHandle, DescriptorHeapId, PipelineStateId, PlacedFootprint,
    ResourceState, RootSignatureId, TextureId,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

/// Scissor rectangle in render target pixels, `right`/`bottom` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Source box of a texture-to-texture copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One command recorded into a command list.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TransitionBarrier {
        texture: TextureId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Marks `after` as the active resource of the heap range it shares with
    /// other placed resources.
    AliasingBarrier {
        before: Option<TextureId>,
        after: TextureId,
    },
    SetDescriptorHeap(DescriptorHeapId),
    SetRootSignature(RootSignatureId),
    SetPipelineState(PipelineStateId),
    SetRootConstantBuffer {
        slot: u32,
        buffer: BufferId,
        offset: u64,
    },
    SetRootDescriptorTable {
        slot: u32,
        descriptor: DescriptorHandle,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetRenderTargets {
        color: Option<DescriptorHandle>,
        depth_stencil: Option<DescriptorHandle>,
    },
    ClearRenderTarget {
        view: DescriptorHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: DescriptorHandle,
        depth: f32,
        stencil: u8,
    },
    SetStencilRef(u8),
    SetBlendFactor([f32; 4]),
    SetVertexBuffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
        stride: u32,
    },
    SetIndexBuffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    DrawIndexed {
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
    },
    CopyBufferToTexture {
        src: BufferId,
        footprint: PlacedFootprint,
        dst: TextureId,
    },
    CopyTextureRegion {
        src: TextureId,
        region: CopyRegion,
        dst: TextureId,
        dst_x: u32,
        dst_y: u32,
    },
    ResolveSubresource {
        src: TextureId,
        dst: TextureId,
    },
}

impl Command {
    /// Textures this command reads or writes.
    pub fn textures(&self) -> Vec<TextureId> {
        match self {
            Command::TransitionBarrier { texture, .. } => vec![*texture],
            Command::AliasingBarrier { before, after } => {
                before.iter().copied().chain(std::iter::once(*after)).collect()
            }
            Command::CopyBufferToTexture { dst, .. } => vec![*dst],
            Command::CopyTextureRegion { src, dst, .. } | Command::ResolveSubresource { src, dst } => {
                vec![*src, *dst]
            }
            _ => Vec::new(),
        }
    }

    /// Buffer this command reads, if any.
    pub fn buffer(&self) -> Option<BufferId> {
        match self {
            Command::SetRootConstantBuffer { buffer, .. }
            | Command::SetVertexBuffer { buffer, .. }
            | Command::SetIndexBuffer { buffer, .. }
            | Command::CopyBufferToTexture { src: buffer, .. } => Some(*buffer),
            _ => None,
        }
    }
}
