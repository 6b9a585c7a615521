#![cfg(not(target_arch = "wasm32"))]

use std::io::Write;
use std::path::Path;

use glam::IVec2;
use pretty_assertions::assert_eq;
use quill_d3d12::device::Device;
use quill_d3d12::soft::SoftDevice;
use quill_d3d12::{RenderInterface, RendererConfig, ValidationMode};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn renderer() -> RenderInterface<SoftDevice> {
    let config = RendererConfig {
        validation: ValidationMode::Log,
        preallocated_constant_buffers: 8,
        ..RendererConfig::default()
    };
    let mut renderer = RenderInterface::new(SoftDevice::new(), config).unwrap();
    renderer.set_viewport(32, 32).unwrap();
    renderer
}

/// 32-bit bottom-up TGA from rows of BGRA texels, last row first.
fn write_tga(path: &Path, width: u16, height: u16, bgra_bottom_up: &[u8]) {
    let mut bytes = vec![0u8; 18];
    bytes[2] = 2;
    bytes[12..14].copy_from_slice(&width.to_le_bytes());
    bytes[14..16].copy_from_slice(&height.to_le_bytes());
    bytes[16] = 32;
    bytes[17] = 8;
    bytes.extend_from_slice(bgra_bottom_up);
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(&bytes).unwrap();
}

#[test]
fn loaded_texture_reads_back_as_premultiplied_rgba() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swatch.tga");
    write_tga(
        &path,
        2,
        2,
        &[
            // Bottom row: opaque red, half-transparent blue.
            0, 0, 255, 255, /**/ 255, 0, 0, 128, //
            // Top row: opaque green, fully transparent white.
            0, 255, 0, 255, /**/ 255, 255, 255, 0,
        ],
    );

    let mut renderer = renderer();
    let (texture, dimensions) = renderer.load_texture(&path).unwrap();
    assert_eq!(dimensions, IVec2::new(2, 2));
    assert_eq!(renderer.stats().texture_uploads, 1);

    let id = renderer.texture_id(texture).unwrap();
    let pixels = renderer.device().read_texture(id).unwrap();
    assert_eq!(
        pixels,
        vec![
            0, 255, 0, 255, /**/ 0, 0, 0, 0, //
            255, 0, 0, 255, /**/ 0, 0, 128, 128,
        ]
    );
    assert!(renderer.device().debug_messages().is_empty());
}

#[test]
fn unreadable_texture_files_return_none() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut renderer = renderer();

    assert_eq!(renderer.load_texture(&dir.path().join("missing.tga")), None);

    let path = dir.path().join("paletted.tga");
    let mut bytes = vec![0u8; 18];
    bytes[2] = 1;
    std::fs::write(&path, bytes).unwrap();
    assert_eq!(renderer.load_texture(&path), None);

    assert_eq!(renderer.texture_count(), 0);
    assert_eq!(renderer.validator().failures(), 0);
}

#[test]
fn generated_texture_with_the_wrong_size_is_rejected() {
    init_tracing();
    let mut renderer = renderer();
    assert_eq!(renderer.generate_texture(&[0; 12], IVec2::new(2, 2)), None);
    assert_eq!(renderer.generate_texture(&[], IVec2::new(0, 4)), None);
    assert_eq!(renderer.validator().failures(), 0);
    assert_eq!(renderer.texture_count(), 0);
    assert_eq!(renderer.texture_statistics().placed_allocation_count, 0);
}
