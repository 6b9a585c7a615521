use std::mem::offset_of;

use windows::core::{s, PCSTR};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::device::{
    BlendState, ClearValue, DescriptorHeapKind, QueueKind, ResourceState, StencilState,
    TextureDesc, TextureFormat, TextureUsage,
};
use crate::geometry::Vertex;

pub(super) fn dxgi_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
    }
}

pub(super) fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::ResolveSource => D3D12_RESOURCE_STATE_RESOLVE_SOURCE,
        ResourceState::ResolveDest => D3D12_RESOURCE_STATE_RESOLVE_DEST,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
    }
}

pub(super) fn command_list_type(kind: QueueKind) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        QueueKind::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueKind::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

pub(super) fn descriptor_heap_type(kind: DescriptorHeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        DescriptorHeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

pub(super) fn texture_desc(desc: &TextureDesc) -> D3D12_RESOURCE_DESC {
    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if desc.usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if desc.usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        if !desc.usage.contains(TextureUsage::SHADER_RESOURCE) {
            flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
        }
    }
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        Alignment: 0,
        Width: desc.width as u64,
        Height: desc.height,
        DepthOrArraySize: 1,
        MipLevels: desc.mip_levels.max(1) as u16,
        Format: dxgi_format(desc.format),
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: desc.sample_count.max(1),
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
        Flags: flags,
    }
}

pub(super) fn buffer_desc(size: u64) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
        Width: size,
        Height: 1,
        DepthOrArraySize: 1,
        MipLevels: 1,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
        ..Default::default()
    }
}

pub(super) fn clear_value(format: TextureFormat, value: ClearValue) -> D3D12_CLEAR_VALUE {
    let format = dxgi_format(format);
    match value {
        ClearValue::Color(color) => D3D12_CLEAR_VALUE {
            Format: format,
            Anonymous: D3D12_CLEAR_VALUE_0 { Color: color },
        },
        ClearValue::DepthStencil { depth, stencil } => D3D12_CLEAR_VALUE {
            Format: format,
            Anonymous: D3D12_CLEAR_VALUE_0 {
                DepthStencil: D3D12_DEPTH_STENCIL_VALUE {
                    Depth: depth,
                    Stencil: stencil,
                },
            },
        },
    }
}

pub(super) fn blend_desc(blend: BlendState, color_write: bool) -> D3D12_BLEND_DESC {
    let (enabled, src, dst) = match blend {
        BlendState::PremultipliedAlpha => (true, D3D12_BLEND_ONE, D3D12_BLEND_INV_SRC_ALPHA),
        BlendState::ConstantFactor => (true, D3D12_BLEND_BLEND_FACTOR, D3D12_BLEND_INV_SRC_ALPHA),
        BlendState::Replace => (false, D3D12_BLEND_ONE, D3D12_BLEND_ZERO),
    };
    let target = D3D12_RENDER_TARGET_BLEND_DESC {
        BlendEnable: enabled.into(),
        LogicOpEnable: false.into(),
        SrcBlend: src,
        DestBlend: dst,
        BlendOp: D3D12_BLEND_OP_ADD,
        SrcBlendAlpha: src,
        DestBlendAlpha: dst,
        BlendOpAlpha: D3D12_BLEND_OP_ADD,
        LogicOp: D3D12_LOGIC_OP_NOOP,
        RenderTargetWriteMask: if color_write {
            D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8
        } else {
            0
        },
    };
    let mut desc = D3D12_BLEND_DESC::default();
    desc.RenderTarget[0] = target;
    desc
}

pub(super) fn depth_stencil_desc(stencil: StencilState) -> D3D12_DEPTH_STENCIL_DESC {
    let (func, pass) = match stencil {
        StencilState::Disabled => (D3D12_COMPARISON_FUNC_ALWAYS, D3D12_STENCIL_OP_KEEP),
        StencilState::Equal => (D3D12_COMPARISON_FUNC_EQUAL, D3D12_STENCIL_OP_KEEP),
        StencilState::Replace => (D3D12_COMPARISON_FUNC_ALWAYS, D3D12_STENCIL_OP_REPLACE),
        StencilState::Increment => (D3D12_COMPARISON_FUNC_EQUAL, D3D12_STENCIL_OP_INCR_SAT),
    };
    let face = D3D12_DEPTH_STENCILOP_DESC {
        StencilFailOp: D3D12_STENCIL_OP_KEEP,
        StencilDepthFailOp: D3D12_STENCIL_OP_KEEP,
        StencilPassOp: pass,
        StencilFunc: func,
    };
    D3D12_DEPTH_STENCIL_DESC {
        DepthEnable: false.into(),
        DepthWriteMask: D3D12_DEPTH_WRITE_MASK_ZERO,
        DepthFunc: D3D12_COMPARISON_FUNC_ALWAYS,
        StencilEnable: (stencil != StencilState::Disabled).into(),
        StencilReadMask: 0xff,
        StencilWriteMask: if stencil.writes_stencil() { 0xff } else { 0 },
        FrontFace: face,
        BackFace: face,
    }
}

fn vertex_element(name: PCSTR, format: DXGI_FORMAT, offset: usize) -> D3D12_INPUT_ELEMENT_DESC {
    D3D12_INPUT_ELEMENT_DESC {
        SemanticName: name,
        SemanticIndex: 0,
        Format: format,
        InputSlot: 0,
        AlignedByteOffset: offset as u32,
        InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
        InstanceDataStepRate: 0,
    }
}

/// Input layout of [`Vertex`].
pub(super) fn vertex_layout() -> [D3D12_INPUT_ELEMENT_DESC; 3] {
    [
        vertex_element(s!("POSITION"), DXGI_FORMAT_R32G32_FLOAT, offset_of!(Vertex, position)),
        vertex_element(s!("COLOR"), DXGI_FORMAT_R8G8B8A8_UNORM, offset_of!(Vertex, colour)),
        vertex_element(s!("TEXCOORD"), DXGI_FORMAT_R32G32_FLOAT, offset_of!(Vertex, tex_coord)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_only_writes_when_the_pass_writes() {
        let equal = depth_stencil_desc(StencilState::Equal);
        assert_eq!(equal.StencilWriteMask, 0);
        assert_eq!(equal.FrontFace.StencilFunc, D3D12_COMPARISON_FUNC_EQUAL);

        let increment = depth_stencil_desc(StencilState::Increment);
        assert_eq!(increment.StencilWriteMask, 0xff);
        assert_eq!(increment.BackFace.StencilPassOp, D3D12_STENCIL_OP_INCR_SAT);

        assert!(!depth_stencil_desc(StencilState::Disabled).StencilEnable.as_bool());
    }

    #[test]
    fn depth_only_targets_deny_shader_access() {
        let desc = TextureDesc::texture_2d(8, 8, TextureFormat::D24UnormS8Uint)
            .with_usage(TextureUsage::DEPTH_STENCIL)
            .with_sample_count(2);
        let native = texture_desc(&desc);
        assert_eq!(
            native.Flags,
            D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL | D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE
        );
        assert_eq!(native.SampleDesc.Count, 2);
        assert_eq!(native.Format, DXGI_FORMAT_D24_UNORM_S8_UINT);
    }

    #[test]
    fn vertex_layout_matches_the_vertex_struct() {
        let layout = vertex_layout();
        let offsets: Vec<u32> = layout.iter().map(|e| e.AlignedByteOffset).collect();
        assert_eq!(offsets, vec![0, 8, 12]);
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
    }
}
