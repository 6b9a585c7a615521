use bytemuck::{Pod, Zeroable};
use glam::{IVec2, Vec2};

use crate::device::ScissorRect;

/// Vertex layout shared by every geometry program.
///
/// `colour` is premultiplied RGBA8.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub colour: [u8; 4],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec2, colour: [u8; 4], tex_coord: Vec2) -> Self {
        Self {
            position: position.to_array(),
            colour,
            tex_coord: tex_coord.to_array(),
        }
    }
}

/// Two triangles covering `origin..origin + size`, with texture coordinates
/// spanning `uv_min..uv_max`.
pub fn quad(origin: Vec2, size: Vec2, colour: [u8; 4], uv_min: Vec2, uv_max: Vec2) -> ([Vertex; 4], [u32; 6]) {
    let vertices = [
        Vertex::new(origin, colour, uv_min),
        Vertex::new(origin + Vec2::new(size.x, 0.0), colour, Vec2::new(uv_max.x, uv_min.y)),
        Vertex::new(origin + size, colour, uv_max),
        Vertex::new(origin + Vec2::new(0.0, size.y), colour, Vec2::new(uv_min.x, uv_max.y)),
    ];
    (vertices, [0, 1, 2, 0, 2, 3])
}

/// Integer rectangle, `right`/`bottom` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rectanglei {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rectanglei {
    pub fn from_position_size(position: IVec2, size: IVec2) -> Self {
        Self {
            left: position.x,
            top: position.y,
            right: position.x + size.x,
            bottom: position.y + size.y,
        }
    }

    pub fn from_size(size: IVec2) -> Self {
        Self::from_position_size(IVec2::ZERO, size)
    }

    pub fn position(&self) -> IVec2 {
        IVec2::new(self.left, self.top)
    }

    pub fn size(&self) -> IVec2 {
        IVec2::new(self.width(), self.height())
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn intersect(&self, other: &Rectanglei) -> Rectanglei {
        Rectanglei {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        }
    }

    /// Clamps to a `width`×`height` target. Rectangles entirely outside it
    /// come back empty rather than inverted.
    pub fn to_scissor(&self, width: u32, height: u32) -> ScissorRect {
        let clamp_x = |v: i32| v.clamp(0, width as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, height as i32) as u32;
        let left = clamp_x(self.left);
        let top = clamp_y(self.top);
        ScissorRect {
            left,
            top,
            right: clamp_x(self.right).max(left),
            bottom: clamp_y(self.bottom).max(top),
        }
    }
}
