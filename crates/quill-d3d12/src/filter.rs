//! Filter compilation: opacity, blur, drop shadow, the colour-matrix family
//! and mask images.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::dictionary::Dictionary;

/// Taps of the separable Gaussian kernel; the shader reads `BLUR_NUM_WEIGHTS`
/// weights and mirrors them.
pub const BLUR_SIZE: usize = 7;
pub const BLUR_NUM_WEIGHTS: usize = (BLUR_SIZE + 1) / 2;

/// Largest sigma a single blur pass handles; larger ones downscale first.
pub const MAX_SINGLE_PASS_SIGMA: f32 = 3.0;
pub const MAX_BLUR_PASS_LEVEL: u32 = 10;

/// Below this the blur is skipped entirely.
pub const MIN_BLUR_SIGMA: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompiledFilter {
    /// Composites with a constant blend factor.
    Opacity { value: f32 },
    Blur { sigma: f32 },
    DropShadow {
        /// Premultiplied.
        colour: [f32; 4],
        offset: Vec2,
        sigma: f32,
    },
    /// Applied to premultiplied colour; column 3 is scaled by alpha.
    ColorMatrix(Mat4),
    /// Multiplies by the alpha of the saved blend mask.
    MaskImage,
}

/// How a blur of some sigma is split into downscaling and a single pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurParameters {
    /// The source is halved this many times before blurring.
    pub pass_level: u32,
    /// Sigma of the pass at the downscaled resolution.
    pub sigma: f32,
}

pub fn sigma_to_parameters(desired_sigma: f32) -> BlurParameters {
    let scaled = (desired_sigma * (2.0 / MAX_SINGLE_PASS_SIGMA)).max(0.0) as u32;
    let pass_level = scaled.checked_ilog2().unwrap_or(0).min(MAX_BLUR_PASS_LEVEL);
    let sigma = (desired_sigma / (1u32 << pass_level) as f32).clamp(0.0, MAX_SINGLE_PASS_SIGMA);
    BlurParameters { pass_level, sigma }
}

/// Normalised half-kernel: `w[0] + 2 * (w[1] + .. + w[n-1]) == 1`.
pub fn blur_weights(sigma: f32) -> [f32; BLUR_NUM_WEIGHTS] {
    let mut weights = [0.0; BLUR_NUM_WEIGHTS];
    let mut normalization = 0.0;
    for (i, weight) in weights.iter_mut().enumerate() {
        *weight = if sigma.abs() < 0.1 {
            if i == 0 { 1.0 } else { 0.0 }
        } else {
            let x = i as f32;
            (-(x * x) / (2.0 * sigma * sigma)).exp() / ((2.0 * std::f32::consts::PI).sqrt() * sigma)
        };
        normalization += if i == 0 { 1.0 } else { 2.0 } * *weight;
    }
    for weight in &mut weights {
        *weight /= normalization;
    }
    weights
}

fn matrix_from_rows(rows: [[f32; 4]; 4]) -> Mat4 {
    Mat4::from_cols_array_2d(&rows).transpose()
}

pub fn brightness_matrix(value: f32) -> Mat4 {
    Mat4::from_diagonal(Vec4::new(value, value, value, 1.0))
}

pub fn contrast_matrix(value: f32) -> Mat4 {
    let grayness = 0.5 - 0.5 * value;
    let mut matrix = Mat4::from_diagonal(Vec4::new(value, value, value, 1.0));
    matrix.w_axis = Vec4::new(grayness, grayness, grayness, 1.0);
    matrix
}

pub fn invert_matrix(value: f32) -> Mat4 {
    let inverted = value.clamp(0.0, 1.0);
    let scale = 1.0 - 2.0 * inverted;
    let mut matrix = Mat4::from_diagonal(Vec4::new(scale, scale, scale, 1.0));
    matrix.w_axis = Vec4::new(inverted, inverted, inverted, 1.0);
    matrix
}

pub fn grayscale_matrix(value: f32) -> Mat4 {
    let value = value.clamp(0.0, 1.0);
    let rev = 1.0 - value;
    let gray = value * Vec3::new(0.2126, 0.7152, 0.0722);
    matrix_from_rows([
        [gray.x + rev, gray.y, gray.z, 0.0],
        [gray.x, gray.y + rev, gray.z, 0.0],
        [gray.x, gray.y, gray.z + rev, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ])
}

pub fn sepia_matrix(value: f32) -> Mat4 {
    let value = value.clamp(0.0, 1.0);
    let rev = 1.0 - value;
    let r = value * Vec3::new(0.393, 0.769, 0.189);
    let g = value * Vec3::new(0.349, 0.686, 0.168);
    let b = value * Vec3::new(0.272, 0.534, 0.131);
    matrix_from_rows([
        [r.x + rev, r.y, r.z, 0.0],
        [g.x, g.y + rev, g.z, 0.0],
        [b.x, b.y, b.z + rev, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ])
}

/// `angle` in radians.
pub fn hue_rotate_matrix(angle: f32) -> Mat4 {
    let (s, c) = angle.sin_cos();
    matrix_from_rows([
        [0.213 + 0.787 * c - 0.213 * s, 0.715 - 0.715 * c - 0.715 * s, 0.072 - 0.072 * c + 0.928 * s, 0.0],
        [0.213 - 0.213 * c + 0.143 * s, 0.715 + 0.285 * c + 0.140 * s, 0.072 - 0.072 * c - 0.283 * s, 0.0],
        [0.213 - 0.213 * c - 0.787 * s, 0.715 - 0.715 * c + 0.715 * s, 0.072 + 0.928 * c + 0.072 * s, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ])
}

pub fn saturate_matrix(value: f32) -> Mat4 {
    let v = value;
    matrix_from_rows([
        [0.213 + 0.787 * v, 0.715 - 0.715 * v, 0.072 - 0.072 * v, 0.0],
        [0.213 - 0.213 * v, 0.715 + 0.285 * v, 0.072 - 0.072 * v, 0.0],
        [0.213 - 0.213 * v, 0.715 - 0.715 * v, 0.072 + 0.928 * v, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ])
}

/// What the colour-matrix shader does to one premultiplied texel.
pub fn apply_color_matrix(matrix: &Mat4, premultiplied: Vec4) -> Vec4 {
    let rgb = (*matrix * premultiplied).truncate();
    rgb.extend(premultiplied.w)
}

pub(crate) fn premultiply(colour: [u8; 4]) -> [f32; 4] {
    let alpha = colour[3] as f32 / 255.0;
    [
        colour[0] as f32 / 255.0 * alpha,
        colour[1] as f32 / 255.0 * alpha,
        colour[2] as f32 / 255.0 * alpha,
        alpha,
    ]
}

/// Compiles a named filter, or `None` for names it does not know.
pub fn compile_filter(name: &str, parameters: &Dictionary) -> Option<CompiledFilter> {
    let value = || parameters.float("value", 1.0);
    let filter = match name {
        "opacity" => CompiledFilter::Opacity { value: value() },
        "blur" => {
            let sigma = if parameters.contains("sigma") {
                parameters.float("sigma", 0.0)
            } else {
                0.5 * parameters.float("radius", 0.0)
            };
            CompiledFilter::Blur { sigma }
        }
        "drop-shadow" => CompiledFilter::DropShadow {
            colour: premultiply(parameters.colour("color", [0, 0, 0, 255])),
            offset: parameters.vec2("offset", Vec2::ZERO),
            sigma: parameters.float("sigma", 0.0),
        },
        "brightness" => CompiledFilter::ColorMatrix(brightness_matrix(value())),
        "contrast" => CompiledFilter::ColorMatrix(contrast_matrix(value())),
        "invert" => CompiledFilter::ColorMatrix(invert_matrix(value())),
        "grayscale" => CompiledFilter::ColorMatrix(grayscale_matrix(value())),
        "sepia" => CompiledFilter::ColorMatrix(sepia_matrix(value())),
        "hue-rotate" => CompiledFilter::ColorMatrix(hue_rotate_matrix(value())),
        "saturate" => CompiledFilter::ColorMatrix(saturate_matrix(value())),
        _ => return None,
    };
    Some(filter)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct ColorMatrixConstants {
    pub matrix: [f32; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct BlurConstants {
    pub texel_offset: [f32; 2],
    pub texcoord_min: [f32; 2],
    pub texcoord_max: [f32; 2],
    pub _pad: [f32; 2],
    pub weights: [f32; BLUR_NUM_WEIGHTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct DropShadowConstants {
    pub colour: [f32; 4],
    pub texcoord_min: [f32; 2],
    pub texcoord_max: [f32; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec4, b: Vec4) -> bool {
        (a - b).abs().max_element() < 1e-4
    }

    #[test]
    fn weights_are_normalised() {
        for sigma in [0.0, 0.5, 1.0, 2.5, 3.0] {
            let w = blur_weights(sigma);
            let total = w[0] + 2.0 * w[1..].iter().sum::<f32>();
            assert!((total - 1.0).abs() < 1e-5, "sigma {sigma}: {total}");
        }
        assert_eq!(blur_weights(0.05), [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn large_sigmas_downscale() {
        assert_eq!(sigma_to_parameters(1.0), BlurParameters { pass_level: 0, sigma: 1.0 });
        let p = sigma_to_parameters(13.0);
        assert_eq!(p.pass_level, 3);
        assert!((p.sigma - 1.625).abs() < 1e-6);
        assert!(sigma_to_parameters(1.0e6).pass_level <= MAX_BLUR_PASS_LEVEL);
        assert!(sigma_to_parameters(1.0e6).sigma <= MAX_SINGLE_PASS_SIGMA);
    }

    #[test]
    fn invert_turns_white_black() {
        let white = Vec4::ONE;
        assert!(approx(apply_color_matrix(&invert_matrix(1.0), white), Vec4::new(0.0, 0.0, 0.0, 1.0)));
        // Half-transparent premultiplied white inverts to half-transparent black.
        let half = Vec4::new(0.5, 0.5, 0.5, 0.5);
        assert!(approx(apply_color_matrix(&invert_matrix(1.0), half), Vec4::new(0.0, 0.0, 0.0, 0.5)));
    }

    #[test]
    fn identity_parameters_leave_colour_alone() {
        let colour = Vec4::new(0.2, 0.4, 0.6, 1.0);
        for matrix in [
            brightness_matrix(1.0),
            contrast_matrix(1.0),
            invert_matrix(0.0),
            grayscale_matrix(0.0),
            sepia_matrix(0.0),
            hue_rotate_matrix(0.0),
            saturate_matrix(1.0),
        ] {
            assert!(approx(apply_color_matrix(&matrix, colour), colour), "{matrix:?}");
        }
    }

    #[test]
    fn grayscale_uses_luminance() {
        let red = Vec4::new(1.0, 0.0, 0.0, 1.0);
        let out = apply_color_matrix(&grayscale_matrix(1.0), red);
        assert!(approx(out, Vec4::new(0.2126, 0.2126, 0.2126, 1.0)));
    }

    #[test]
    fn compile_reads_parameters() {
        let blur = compile_filter("blur", &Dictionary::new().with("radius", 4.0f32));
        assert_eq!(blur, Some(CompiledFilter::Blur { sigma: 2.0 }));

        let shadow = compile_filter(
            "drop-shadow",
            &Dictionary::new()
                .with("color", [255u8, 0, 0, 255])
                .with("offset", Vec2::new(2.0, 3.0))
                .with("sigma", 1.0f32),
        );
        assert_eq!(
            shadow,
            Some(CompiledFilter::DropShadow {
                colour: [1.0, 0.0, 0.0, 1.0],
                offset: Vec2::new(2.0, 3.0),
                sigma: 1.0
            })
        );
        assert_eq!(compile_filter("opacity", &Dictionary::new()), Some(CompiledFilter::Opacity { value: 1.0 }));
        assert_eq!(compile_filter("wobble", &Dictionary::new()), None);
    }
}
