use bitflags::bitflags;
use quill_valloc::align_up;

use super::TEXTURE_DATA_PITCH_ALIGNMENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    D24UnormS8Uint,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::D24UnormS8Uint => 4,
        }
    }

    pub fn is_depth_stencil(self) -> bool {
        matches!(self, TextureFormat::D24UnormS8Uint)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Single-sampled, single-mip 2D texture that can be uploaded to and sampled.
    pub fn texture_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            sample_count: 1,
            format,
            usage: TextureUsage::SHADER_RESOURCE | TextureUsage::COPY_DST,
        }
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    /// Bytes of the most detailed mip, one sample per pixel.
    pub fn base_memory(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }

    pub fn tight_row_bytes(&self) -> u64 {
        self.width as u64 * self.format.bytes_per_pixel() as u64
    }
}

/// Where a texture is expected to be in the resource state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopyDest,
    CopySource,
    PixelShaderResource,
    RenderTarget,
    DepthWrite,
    ResolveSource,
    ResolveDest,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

/// Layout of one subresource inside an upload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedFootprint {
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Aligned to [`TEXTURE_DATA_PITCH_ALIGNMENT`].
    pub row_pitch: u64,
    pub row_size: u64,
    pub total_bytes: u64,
}

/// `GetCopyableFootprints` for the first subresource of `desc`.
pub fn copyable_footprint(desc: &TextureDesc) -> PlacedFootprint {
    let row_size = desc.tight_row_bytes();
    let row_pitch = align_up(row_size, TEXTURE_DATA_PITCH_ALIGNMENT);
    let total_bytes = if desc.height == 0 {
        0
    } else {
        row_pitch * (desc.height as u64 - 1) + row_size
    };
    PlacedFootprint {
        offset: 0,
        width: desc.width,
        height: desc.height,
        format: desc.format,
        row_pitch,
        row_size,
        total_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprint_pads_rows_to_pitch_alignment() {
        let desc = TextureDesc::texture_2d(3, 2, TextureFormat::Rgba8Unorm);
        let footprint = copyable_footprint(&desc);
        assert_eq!(footprint.row_size, 12);
        assert_eq!(footprint.row_pitch, 256);
        assert_eq!(footprint.total_bytes, 256 + 12);
    }

    #[test]
    fn footprint_keeps_aligned_rows() {
        let desc = TextureDesc::texture_2d(64, 4, TextureFormat::Rgba8Unorm);
        let footprint = copyable_footprint(&desc);
        assert_eq!(footprint.row_pitch, 256);
        assert_eq!(footprint.total_bytes, 1024);
    }

    #[test]
    fn base_memory_ignores_samples() {
        let desc = TextureDesc::texture_2d(16, 16, TextureFormat::Rgba8Unorm).with_sample_count(4);
        assert_eq!(desc.base_memory(), 1024);
    }
}
