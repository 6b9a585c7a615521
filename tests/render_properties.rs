#![cfg(not(target_arch = "wasm32"))]

use anyhow::Result;
use glam::{IVec2, Vec2};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use quill::d3d12::device::Device;
use quill::d3d12::quad;
use quill::d3d12::soft::SoftDevice;
use quill::{Rectanglei, RenderError, RenderInterface, RendererConfig, ValidationMode};

fn config() -> RendererConfig {
    RendererConfig {
        validation: ValidationMode::Log,
        preallocated_constant_buffers: 8,
        ..RendererConfig::default()
    }
}

fn renderer(latency: usize) -> Result<RenderInterface<SoftDevice>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut renderer = RenderInterface::new(SoftDevice::with_latency(latency), config())?;
    renderer.set_viewport(40, 30)?;
    Ok(renderer)
}

#[test]
fn textures_at_the_placement_threshold_are_placed() -> Result<()> {
    let mut renderer = renderer(0)?;
    let limit = renderer.config().textures.size_limit_for_being_placed();
    // 512x512 RGBA8 with a single mip is exactly a quarter of the default heap.
    assert_eq!(limit, 512 * 512 * 4);

    let at_limit = renderer.generate_texture(&vec![0; 512 * 512 * 4], IVec2::new(512, 512));
    assert!(at_limit.is_some());
    assert_eq!(renderer.stats().placed_textures, 1);
    assert_eq!(renderer.stats().committed_textures, 0);

    let over_limit = renderer.generate_texture(&vec![0; 513 * 512 * 4], IVec2::new(513, 512));
    assert!(over_limit.is_some());
    assert_eq!(renderer.stats().placed_textures, 1);
    assert_eq!(renderer.stats().committed_textures, 1);
    assert_eq!(renderer.texture_statistics().placed_allocation_count, 1);
    Ok(())
}

#[test]
fn empty_frames_signal_monotonic_fence_values() -> Result<()> {
    for latency in 0..5 {
        let mut renderer = renderer(latency)?;
        let mut previous = renderer.last_signaled_fence_value();
        for _ in 0..12 {
            renderer.begin_frame()?;
            renderer.end_frame()?;

            let signaled = renderer.last_signaled_fence_value();
            let completed = renderer.device().completed_fence_value(renderer.fence())?;
            assert_eq!(signaled, previous + 1);
            assert!(completed <= signaled);
            previous = signaled;
        }
        // Reusing a command allocator while its list is in flight is reported here.
        let messages = renderer.device().debug_messages();
        assert!(messages.is_empty(), "latency {latency}: {messages:?}");
        assert_eq!(renderer.device().presents(), 12);
    }
    Ok(())
}

#[test]
fn degenerate_scissor_only_affects_its_own_frame() -> Result<()> {
    let mut renderer = renderer(1)?;
    let (vertices, indices) = quad(Vec2::ZERO, Vec2::splat(8.0), [255; 4], Vec2::ZERO, Vec2::ONE);
    let geometry = renderer
        .compile_geometry(&vertices, &indices)
        .ok_or_else(|| anyhow::anyhow!("geometry did not compile"))?;

    renderer.begin_frame()?;
    renderer.enable_scissor_region(true);
    renderer.set_scissor_region(Rectanglei::from_size(IVec2::new(20, 0)));
    renderer.render_geometry(geometry, Vec2::ZERO, None);
    renderer.end_frame()?;
    assert_eq!(renderer.stats().draw_calls_suppressed, 1);

    renderer.begin_frame()?;
    renderer.render_geometry(geometry, Vec2::ZERO, None);
    renderer.end_frame()?;
    renderer.device_mut().complete_all_work();

    let labels: Vec<_> = renderer.device_mut().take_draws().into_iter().map(|draw| draw.label).collect();
    assert_eq!(
        labels,
        vec!["postprocess-passthrough", "color-stencil-always", "postprocess-passthrough"]
    );
    assert_eq!(renderer.stats().draw_calls_suppressed, 1);
    Ok(())
}

#[test]
fn released_geometry_is_freed_at_the_next_frame() -> Result<()> {
    let mut renderer = renderer(0)?;
    let (vertices, indices) = quad(Vec2::ZERO, Vec2::splat(8.0), [255; 4], Vec2::ZERO, Vec2::ONE);
    let geometry = renderer
        .compile_geometry(&vertices, &indices)
        .ok_or_else(|| anyhow::anyhow!("geometry did not compile"))?;
    let allocations = renderer.buffer_statistics().allocation_count;

    renderer.begin_frame()?;
    renderer.release_geometry(geometry);
    renderer.render_geometry(geometry, Vec2::new(2.0, 2.0), None);
    renderer.end_frame()?;

    assert_eq!(renderer.geometry_count(), 1);
    assert_eq!(renderer.buffer_statistics().allocation_count, allocations);
    assert_eq!(renderer.stats().draw_calls_submitted, 2);

    renderer.begin_frame()?;
    assert_eq!(renderer.geometry_count(), 0);
    assert_eq!(renderer.buffer_statistics().allocation_count, allocations - 2);
    renderer.end_frame()?;
    assert_eq!(renderer.validator().failures(), 0);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum LayerOp {
    Push,
    Pop,
}

fn layer_ops() -> impl Strategy<Value = Vec<LayerOp>> {
    prop::collection::vec(prop_oneof![Just(LayerOp::Push), Just(LayerOp::Pop)], 0..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn balanced_layer_sequences_end_on_the_base_layer(ops in layer_ops()) {
        let mut renderer = renderer(2).unwrap();
        renderer.begin_frame().unwrap();
        let mut depth = 1usize;
        for op in ops {
            match op {
                LayerOp::Push if depth < 5 => {
                    prop_assert!(renderer.push_layer().is_some());
                    depth += 1;
                }
                LayerOp::Pop if depth > 1 => {
                    renderer.pop_layer();
                    depth -= 1;
                }
                _ => {}
            }
            prop_assert_eq!(renderer.layer_stack().layers_size(), depth);
        }
        while depth > 1 {
            renderer.pop_layer();
            depth -= 1;
        }
        prop_assert_eq!(renderer.layer_stack().layers_size(), 1);
        prop_assert!(renderer.end_frame().is_ok());
        prop_assert_eq!(renderer.validator().failures(), 0);
    }

    #[test]
    fn frames_left_with_pushed_layers_fail(extra in 1usize..5) {
        let mut renderer = renderer(0).unwrap();
        renderer.begin_frame().unwrap();
        for _ in 0..extra {
            prop_assert!(renderer.push_layer().is_some());
        }
        prop_assert_eq!(
            renderer.end_frame(),
            Err(RenderError::InvalidState("layer pushes and pops are unbalanced at the end of the frame"))
        );
        prop_assert_eq!(renderer.validator().failures(), 1);

        renderer.begin_frame().unwrap();
        prop_assert_eq!(renderer.layer_stack().layers_size(), 1);
        prop_assert!(renderer.end_frame().is_ok());
    }
}
