//! HLSL for every [`ShaderProgram`], compiled once per device with `D3DCompile`.
//!
//! The constant buffer layouts mirror the `#[repr(C)]` structs the renderer
//! writes: `VertexConstants` at `b0`, the program's pixel constants at `b1`.

use hashbrown::HashMap;
use windows::core::{s, PCSTR};
use windows::Win32::Graphics::Direct3D::Fxc::{
    D3DCompile, D3DCOMPILE_DEBUG, D3DCOMPILE_ENABLE_STRICTNESS, D3DCOMPILE_OPTIMIZATION_LEVEL3,
    D3DCOMPILE_SKIP_OPTIMIZATION,
};
use windows::Win32::Graphics::Direct3D::ID3DBlob;
use windows::Win32::Graphics::Direct3D12::D3D12_SHADER_BYTECODE;

use crate::device::ShaderProgram;
use crate::error::DeviceError;

pub(super) const SHADER_PROGRAMS: [ShaderProgram; 9] = [
    ShaderProgram::Color,
    ShaderProgram::Texture,
    ShaderProgram::Gradient,
    ShaderProgram::Creation,
    ShaderProgram::Passthrough,
    ShaderProgram::ColorMatrix,
    ShaderProgram::BlendMask,
    ShaderProgram::Blur,
    ShaderProgram::DropShadow,
];

const COMMON: &str = r#"
cbuffer VertexConstants : register(b0) {
    float4x4 transform;
    float2 translation;
    float2 vertex_pad;
    float2 texcoord_offset;
    float2 texcoord_scale;
};

struct VertexInput {
    float2 position : POSITION;
    float4 colour : COLOR;
    float2 tex_coord : TEXCOORD0;
};

struct PixelInput {
    float4 position : SV_Position;
    float4 colour : COLOR;
    float2 tex_coord : TEXCOORD0;
    float2 local : TEXCOORD1;
};

SamplerState linear_clamp : register(s0);

PixelInput vs_main(VertexInput input) {
    PixelInput output;
    output.position = mul(transform, float4(input.position + translation, 0.0, 1.0));
    output.colour = input.colour;
    output.tex_coord = input.tex_coord * texcoord_scale + texcoord_offset;
    output.local = input.position;
    return output;
}
"#;

const COLOR: &str = r#"
float4 ps_main(PixelInput input) : SV_Target {
    return input.colour;
}
"#;

const TEXTURE: &str = r#"
Texture2D source : register(t0);

float4 ps_main(PixelInput input) : SV_Target {
    return source.Sample(linear_clamp, input.tex_coord) * input.colour;
}
"#;

const GRADIENT: &str = r#"
#define LINEAR 0
#define RADIAL 1
#define CONIC 2
#define REPEATING_LINEAR 3
#define REPEATING_RADIAL 4
#define REPEATING_CONIC 5
#define PI 3.14159265

cbuffer GradientConstants : register(b1) {
    uint gradient_function;
    uint num_stops;
    float2 gradient_p;
    float2 gradient_v;
    float2 gradient_pad;
    uint4 stop_colours[4];
    float4 stop_positions[4];
};

float4 stop_colour(uint i) {
    uint packed = stop_colours[i / 4][i % 4];
    return float4(packed & 0xff, (packed >> 8) & 0xff, (packed >> 16) & 0xff, packed >> 24) / 255.0;
}

float stop_position(uint i) {
    return stop_positions[i / 4][i % 4];
}

float4 ps_main(PixelInput input) : SV_Target {
    float2 d = input.local - gradient_p;
    float t;
    if (gradient_function == LINEAR || gradient_function == REPEATING_LINEAR) {
        t = dot(d, gradient_v) / dot(gradient_v, gradient_v);
    } else if (gradient_function == RADIAL || gradient_function == REPEATING_RADIAL) {
        t = length(d * gradient_v);
    } else {
        float2 r = float2(gradient_v.x * d.x + gradient_v.y * d.y, gradient_v.x * d.y - gradient_v.y * d.x);
        t = 0.5 + atan2(-r.x, r.y) / (2.0 * PI);
    }

    if (num_stops == 0) {
        return float4(0.0, 0.0, 0.0, 0.0);
    }
    float first = stop_position(0);
    float last = stop_position(num_stops - 1);
    if (gradient_function >= REPEATING_LINEAR && last > first) {
        float period = last - first;
        float x = t - first;
        t = first + (x - period * floor(x / period));
    }

    float4 colour = stop_colour(0);
    [loop]
    for (uint i = 1; i < num_stops; i++) {
        float a = stop_position(i - 1);
        float b = stop_position(i);
        float span = b - a;
        float f = span > 0.0 ? saturate((t - a) / span) : (t >= b ? 1.0 : 0.0);
        colour = lerp(colour, stop_colour(i), f);
    }
    return colour * input.colour;
}
"#;

const CREATION: &str = r#"
cbuffer CreationConstants : register(b1) {
    float2 dimensions;
    float2 creation_pad;
};

float4 ps_main(PixelInput input) : SV_Target {
    float2 uv = input.local / max(dimensions, float2(1.0, 1.0));
    float3 rgb = 0.5 + 0.5 * cos(6.28318 * (uv.xyx + float3(0.0, 0.33, 0.67)));
    return float4(rgb, 1.0) * input.colour;
}
"#;

const PASSTHROUGH: &str = r#"
Texture2D source : register(t0);

float4 ps_main(PixelInput input) : SV_Target {
    return source.Sample(linear_clamp, input.tex_coord);
}
"#;

const COLOR_MATRIX: &str = r#"
Texture2D source : register(t0);

cbuffer ColorMatrixConstants : register(b1) {
    float4x4 color_matrix;
};

float4 ps_main(PixelInput input) : SV_Target {
    float4 texel = source.Sample(linear_clamp, input.tex_coord);
    float3 rgb = mul(color_matrix, texel).rgb;
    return float4(rgb, texel.a);
}
"#;

const BLEND_MASK: &str = r#"
Texture2D source : register(t0);
Texture2D mask : register(t1);

float4 ps_main(PixelInput input) : SV_Target {
    float4 texel = source.Sample(linear_clamp, input.tex_coord);
    return texel * mask.Sample(linear_clamp, input.tex_coord).a;
}
"#;

const BLUR: &str = r#"
Texture2D source : register(t0);

cbuffer BlurConstants : register(b1) {
    float2 texel_offset;
    float2 texcoord_min;
    float2 texcoord_max;
    float2 blur_pad;
    float4 weights;
};

float4 ps_main(PixelInput input) : SV_Target {
    float4 sum = float4(0.0, 0.0, 0.0, 0.0);
    [unroll]
    for (int i = -3; i <= 3; i++) {
        float2 uv = clamp(input.tex_coord + texel_offset * i, texcoord_min, texcoord_max);
        sum += source.Sample(linear_clamp, uv) * weights[abs(i)];
    }
    return sum;
}
"#;

const DROP_SHADOW: &str = r#"
Texture2D source : register(t0);

cbuffer DropShadowConstants : register(b1) {
    float4 shadow_colour;
    float2 shadow_min;
    float2 shadow_max;
};

float4 ps_main(PixelInput input) : SV_Target {
    float2 uv = input.tex_coord;
    bool inside = all(uv >= shadow_min) && all(uv <= shadow_max);
    float alpha = inside ? source.Sample(linear_clamp, uv).a : 0.0;
    return shadow_colour * alpha;
}
"#;

fn pixel_source(program: ShaderProgram) -> &'static str {
    match program {
        ShaderProgram::Color => COLOR,
        ShaderProgram::Texture => TEXTURE,
        ShaderProgram::Gradient => GRADIENT,
        ShaderProgram::Creation => CREATION,
        ShaderProgram::Passthrough => PASSTHROUGH,
        ShaderProgram::ColorMatrix => COLOR_MATRIX,
        ShaderProgram::BlendMask => BLEND_MASK,
        ShaderProgram::Blur => BLUR,
        ShaderProgram::DropShadow => DROP_SHADOW,
    }
}

#[derive(Debug)]
pub(super) struct CompiledProgram {
    pub vertex: ID3DBlob,
    pub pixel: ID3DBlob,
}

pub(super) fn bytecode(blob: &ID3DBlob) -> D3D12_SHADER_BYTECODE {
    unsafe {
        D3D12_SHADER_BYTECODE {
            pShaderBytecode: blob.GetBufferPointer(),
            BytecodeLength: blob.GetBufferSize(),
        }
    }
}

fn blob_text(blob: &ID3DBlob) -> String {
    let bytes = unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) };
    String::from_utf8_lossy(bytes).trim_end_matches('\0').trim_end().to_owned()
}

fn compile(program: ShaderProgram, source: &str, entry: PCSTR, target: PCSTR) -> Result<ID3DBlob, DeviceError> {
    let flags = if cfg!(debug_assertions) {
        D3DCOMPILE_ENABLE_STRICTNESS | D3DCOMPILE_DEBUG | D3DCOMPILE_SKIP_OPTIMIZATION
    } else {
        D3DCOMPILE_ENABLE_STRICTNESS | D3DCOMPILE_OPTIMIZATION_LEVEL3
    };
    let mut code: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    let result = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            PCSTR::null(),
            None,
            None,
            entry,
            target,
            flags,
            0,
            &mut code,
            Some(&mut errors),
        )
    };
    if let Err(err) = result {
        let log = errors.as_ref().map(blob_text).unwrap_or_default();
        tracing::error!(?program, "shader compilation failed: {log}");
        return Err(super::native("D3DCompile")(err));
    }
    code.ok_or_else(|| super::missing("D3DCompile"))
}

pub(super) fn compile_all() -> Result<HashMap<ShaderProgram, CompiledProgram>, DeviceError> {
    let mut programs = HashMap::with_capacity(SHADER_PROGRAMS.len());
    for program in SHADER_PROGRAMS {
        let source = format!("{COMMON}{}", pixel_source(program));
        let vertex = compile(program, &source, s!("vs_main"), s!("vs_5_0"))?;
        let pixel = compile(program, &source, s!("ps_main"), s!("ps_5_0"))?;
        programs.insert(program, CompiledProgram { vertex, pixel });
    }
    tracing::debug!(count = programs.len(), "compiled shader programs");
    Ok(programs)
}
