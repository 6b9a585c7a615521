//! Loader for uncompressed true-colour TGA images.
//!
//! The header is checked here so run-length encoded and colour-mapped files
//! are turned away before `image` decodes the pixels. Pixels come out as
//! premultiplied RGBA8 with the first row at the top.

use std::path::{Path, PathBuf};

use image::ImageFormat;
use thiserror::Error;

const HEADER_LEN: usize = 18;
const IMAGE_TYPE_TRUE_COLOUR: u8 = 2;
#[cfg(test)]
const DESCRIPTOR_TOP_LEFT: u8 = 0x20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TgaError {
    #[error("texture file {0} not found")]
    NotFound(PathBuf),
    #[error("reading {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("truncated TGA: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unsupported TGA image type {0}; only uncompressed true-colour is supported")]
    UnsupportedImageType(u8),
    #[error("colour-mapped TGA images are not supported")]
    ColourMapped,
    #[error("unsupported TGA bit depth {0}; only 24 and 32 are supported")]
    UnsupportedBitDepth(u8),
    #[error("TGA image has zero size ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("decoding TGA: {0}")]
    Decode(String),
}

impl From<image::ImageError> for TgaError {
    fn from(err: image::ImageError) -> Self {
        TgaError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgaImage {
    pub width: u32,
    pub height: u32,
    /// Premultiplied RGBA8, rows top to bottom.
    pub pixels: Vec<u8>,
}

pub fn load(path: &Path) -> Result<TgaImage, TgaError> {
    let bytes = std::fs::read(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => TgaError::NotFound(path.to_owned()),
        _ => TgaError::Io {
            path: path.to_owned(),
            message: err.to_string(),
        },
    })?;
    decode(&bytes)
}

pub fn decode(bytes: &[u8]) -> Result<TgaImage, TgaError> {
    let header = bytes.get(..HEADER_LEN).ok_or(TgaError::Truncated {
        expected: HEADER_LEN,
        actual: bytes.len(),
    })?;
    let id_length = header[0] as usize;
    let colour_map_type = header[1];
    let image_type = header[2];
    let width = u16::from_le_bytes([header[12], header[13]]) as u32;
    let height = u16::from_le_bytes([header[14], header[15]]) as u32;
    let bits_per_pixel = header[16];

    if image_type != IMAGE_TYPE_TRUE_COLOUR {
        return Err(TgaError::UnsupportedImageType(image_type));
    }
    if colour_map_type != 0 {
        return Err(TgaError::ColourMapped);
    }
    if bits_per_pixel != 24 && bits_per_pixel != 32 {
        return Err(TgaError::UnsupportedBitDepth(bits_per_pixel));
    }
    if width == 0 || height == 0 {
        return Err(TgaError::EmptyImage { width, height });
    }

    let expected = HEADER_LEN
        + id_length
        + width as usize * height as usize * (bits_per_pixel as usize / 8);
    if bytes.len() < expected {
        return Err(TgaError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }

    let mut rgba = image::load_from_memory_with_format(bytes, ImageFormat::Tga)?.to_rgba8();
    for texel in rgba.pixels_mut() {
        let alpha = texel[3];
        for channel in &mut texel.0[..3] {
            *channel = premultiply(*channel, alpha);
        }
    }

    Ok(TgaImage {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    })
}

fn premultiply(channel: u8, alpha: u8) -> u8 {
    (channel as u16 * alpha as u16 / 255) as u8
}

/// Encodes straight-alpha RGBA8 as a bottom-up 32-bit TGA.
#[cfg(test)]
pub(crate) fn encode_rgba(width: u16, height: u16, rgba: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; HEADER_LEN];
    bytes[2] = IMAGE_TYPE_TRUE_COLOUR;
    bytes[12..14].copy_from_slice(&width.to_le_bytes());
    bytes[14..16].copy_from_slice(&height.to_le_bytes());
    bytes[16] = 32;
    // Eight alpha bits.
    bytes[17] = 8;
    let row_len = width as usize * 4;
    for row in rgba.chunks_exact(row_len).rev() {
        for texel in row.chunks_exact(4) {
            bytes.extend_from_slice(&[texel[2], texel[1], texel[0], texel[3]]);
        }
    }
    bytes
}
