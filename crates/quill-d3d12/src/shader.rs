//! Gradient and "creation" shaders.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};

use crate::dictionary::{ColorStop, Dictionary};

/// Colour stops beyond this are dropped.
pub const MAX_GRADIENT_STOPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GradientFunction {
    Linear = 0,
    Radial = 1,
    Conic = 2,
    RepeatingLinear = 3,
    RepeatingRadial = 4,
    RepeatingConic = 5,
}

impl GradientFunction {
    fn new(base: GradientFunction, repeating: bool) -> Self {
        match (base, repeating) {
            (GradientFunction::Linear, true) => GradientFunction::RepeatingLinear,
            (GradientFunction::Radial, true) => GradientFunction::RepeatingRadial,
            (GradientFunction::Conic, true) => GradientFunction::RepeatingConic,
            (base, _) => base,
        }
    }

    pub fn is_repeating(self) -> bool {
        matches!(
            self,
            GradientFunction::RepeatingLinear | GradientFunction::RepeatingRadial | GradientFunction::RepeatingConic
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledShader {
    Gradient {
        function: GradientFunction,
        /// Start point (linear) or centre (radial, conic).
        p: Vec2,
        /// Gradient vector (linear), inverse radius (radial) or angle
        /// direction (conic).
        v: Vec2,
        stops: Vec<ColorStop>,
    },
    Creation { dimensions: Vec2 },
}

pub fn compile_shader(name: &str, parameters: &Dictionary) -> Option<CompiledShader> {
    let repeating = parameters.boolean("repeating", false);
    let (function, p, v) = match name {
        "linear-gradient" => {
            let p0 = parameters.vec2("p0", Vec2::ZERO);
            let p1 = parameters.vec2("p1", Vec2::ZERO);
            (GradientFunction::Linear, p0, p1 - p0)
        }
        "radial-gradient" => {
            let radius = parameters.vec2("radius", Vec2::ONE).max(Vec2::splat(f32::EPSILON));
            (GradientFunction::Radial, parameters.vec2("center", Vec2::ZERO), Vec2::ONE / radius)
        }
        "conic-gradient" => {
            let (sin, cos) = parameters.float("angle", 0.0).sin_cos();
            (GradientFunction::Conic, parameters.vec2("center", Vec2::ZERO), Vec2::new(cos, sin))
        }
        "shader" if parameters.string("value") == Some("creation") => {
            return Some(CompiledShader::Creation {
                dimensions: parameters.vec2("dimensions", Vec2::ZERO),
            });
        }
        _ => return None,
    };

    let mut stops = parameters.color_stops("color_stop_list").to_vec();
    if stops.len() > MAX_GRADIENT_STOPS {
        tracing::warn!(
            shader = name,
            stops = stops.len(),
            "gradient has more than {MAX_GRADIENT_STOPS} colour stops; the rest are ignored"
        );
        stops.truncate(MAX_GRADIENT_STOPS);
    }
    Some(CompiledShader::Gradient {
        function: GradientFunction::new(function, repeating),
        p,
        v,
        stops,
    })
}

fn stop_colour(stop: &ColorStop) -> Vec4 {
    Vec4::from_array(stop.colour.map(|c| c as f32 / 255.0))
}

impl CompiledShader {
    /// Premultiplied colour at normalised gradient position `t`, as the
    /// gradient pixel shader computes it.
    pub fn gradient_colour(&self, t: f32) -> Option<Vec4> {
        let CompiledShader::Gradient { function, stops, .. } = self else {
            return None;
        };
        let (first, last) = (stops.first()?, stops.last()?);
        let t = if function.is_repeating() && last.position > first.position {
            let period = last.position - first.position;
            first.position + (t - first.position).rem_euclid(period)
        } else {
            t
        };

        let mut colour = stop_colour(first);
        for pair in stops.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let span = b.position - a.position;
            let f = if span > 0.0 {
                ((t - a.position) / span).clamp(0.0, 1.0)
            } else if t >= b.position {
                1.0
            } else {
                0.0
            };
            colour = colour.lerp(stop_colour(b), f);
        }
        Some(colour)
    }

    pub(crate) fn gradient_constants(&self) -> Option<GradientConstants> {
        let CompiledShader::Gradient { function, p, v, stops } = self else {
            return None;
        };
        let mut constants = GradientConstants {
            function: *function as u32,
            num_stops: stops.len() as u32,
            p: p.to_array(),
            v: v.to_array(),
            _pad: [0.0; 2],
            stop_colours: [0; MAX_GRADIENT_STOPS],
            stop_positions: [0.0; MAX_GRADIENT_STOPS],
        };
        for (i, stop) in stops.iter().enumerate() {
            constants.stop_colours[i] = u32::from_le_bytes(stop.colour);
            constants.stop_positions[i] = stop.position;
        }
        Some(constants)
    }
}

/// Pixel constants of the gradient program. Stop colours are packed RGBA8.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct GradientConstants {
    pub function: u32,
    pub num_stops: u32,
    pub p: [f32; 2],
    pub v: [f32; 2],
    pub _pad: [f32; 2],
    pub stop_colours: [u32; MAX_GRADIENT_STOPS],
    pub stop_positions: [f32; MAX_GRADIENT_STOPS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct CreationConstants {
    pub dimensions: [f32; 2],
    pub _pad: [f32; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(list: &[([u8; 4], f32)]) -> Vec<ColorStop> {
        list.iter().map(|&(colour, position)| ColorStop { colour, position }).collect()
    }

    #[test]
    fn linear_gradient_vector_spans_the_endpoints() {
        let params = Dictionary::new()
            .with("p0", Vec2::new(10.0, 0.0))
            .with("p1", Vec2::new(10.0, 50.0))
            .with("color_stop_list", stops(&[([255, 0, 0, 255], 0.0), ([0, 0, 255, 255], 1.0)]));
        let Some(CompiledShader::Gradient { function, p, v, .. }) = compile_shader("linear-gradient", &params) else {
            panic!("linear gradient did not compile");
        };
        assert_eq!(function, GradientFunction::Linear);
        assert_eq!(p, Vec2::new(10.0, 0.0));
        assert_eq!(v, Vec2::new(0.0, 50.0));
    }

    #[test]
    fn colours_interpolate_between_stops() {
        let params = Dictionary::new()
            .with("color_stop_list", stops(&[([255, 0, 0, 255], 0.0), ([0, 0, 255, 255], 1.0)]));
        let shader = compile_shader("radial-gradient", &params).unwrap();
        let mid = shader.gradient_colour(0.5).unwrap();
        assert!((mid - Vec4::new(0.5, 0.0, 0.5, 1.0)).abs().max_element() < 1e-6);
        assert_eq!(shader.gradient_colour(-1.0).unwrap(), Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(shader.gradient_colour(2.0).unwrap(), Vec4::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn repeating_gradients_wrap() {
        let params = Dictionary::new()
            .with("repeating", true)
            .with("color_stop_list", stops(&[([0, 0, 0, 255], 0.0), ([255, 255, 255, 255], 0.5)]));
        let shader = compile_shader("conic-gradient", &params).unwrap();
        let a = shader.gradient_colour(0.25).unwrap();
        let b = shader.gradient_colour(0.75).unwrap();
        assert!((a - b).abs().max_element() < 1e-6);
    }

    #[test]
    fn stops_beyond_the_limit_are_dropped() {
        let many: Vec<ColorStop> = (0..20)
            .map(|i| ColorStop {
                colour: [i as u8, 0, 0, 255],
                position: i as f32 / 19.0,
            })
            .collect();
        let shader = compile_shader("linear-gradient", &Dictionary::new().with("color_stop_list", many)).unwrap();
        let constants = shader.gradient_constants().unwrap();
        assert_eq!(constants.num_stops, MAX_GRADIENT_STOPS as u32);
        assert_eq!(constants.stop_colours[1], u32::from_le_bytes([1, 0, 0, 255]));
    }

    #[test]
    fn creation_shader_and_unknown_names() {
        let params = Dictionary::new().with("value", "creation").with("dimensions", Vec2::new(4.0, 2.0));
        assert_eq!(
            compile_shader("shader", &params),
            Some(CompiledShader::Creation { dimensions: Vec2::new(4.0, 2.0) })
        );
        assert_eq!(compile_shader("shader", &Dictionary::new()), None);
        assert_eq!(compile_shader("swirl", &Dictionary::new()), None);
    }

    #[test]
    fn constants_fit_the_pixel_half_of_a_slot() {
        assert!(std::mem::size_of::<GradientConstants>() <= 256);
    }
}
