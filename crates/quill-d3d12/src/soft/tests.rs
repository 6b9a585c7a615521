use std::time::Duration;

use super::*;
use crate::device::{copyable_footprint, CopyRegion};

const TIMEOUT: Duration = Duration::from_secs(1);

fn direct_list(device: &mut SoftDevice) -> (QueueId, CommandAllocatorId, CommandListId) {
    let queue = device.create_command_queue(QueueKind::Direct).unwrap();
    let allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
    let list = device.create_command_list(QueueKind::Direct).unwrap();
    (queue, allocator, list)
}

#[test]
fn work_retires_after_latency_is_exceeded() {
    let mut device = SoftDevice::with_latency(2);
    let (queue, allocator, list) = direct_list(&mut device);
    let fence = device.create_fence(0).unwrap();

    device.reset_command_list(list, allocator).unwrap();
    device.close_command_list(list).unwrap();
    device.execute_command_list(queue, list).unwrap();
    device.signal(queue, fence, 1).unwrap();
    assert_eq!(device.completed_fence_value(fence).unwrap(), 0);

    let error = device.reset_command_allocator(allocator).unwrap_err();
    assert_eq!(error, DeviceError::AllocatorInFlight(allocator.0));
    assert_eq!(
        device.take_debug_messages()[0].kind,
        DebugMessageKind::AllocatorResetWhileInFlight
    );

    device.wait_for_fence(fence, 1, TIMEOUT).unwrap();
    assert_eq!(device.completed_fence_value(fence).unwrap(), 1);
    device.reset_command_allocator(allocator).unwrap();
    assert!(device.debug_messages().is_empty());
}

#[test]
fn waiting_on_an_unsignalled_value_times_out() {
    let mut device = SoftDevice::new();
    let fence = device.create_fence(0).unwrap();
    let error = device.wait_for_fence(fence, 5, TIMEOUT).unwrap_err();
    assert!(matches!(error, DeviceError::FenceTimeout { value: 5, .. }));
}

#[test]
fn non_monotonic_signal_is_reported() {
    let mut device = SoftDevice::new();
    let queue = device.create_command_queue(QueueKind::Direct).unwrap();
    let fence = device.create_fence(0).unwrap();
    device.signal(queue, fence, 2).unwrap();
    device.signal(queue, fence, 2).unwrap();
    assert_eq!(
        device.debug_messages()[0].kind,
        DebugMessageKind::NonMonotonicFenceSignal
    );
}

#[test]
fn recording_into_a_closed_list_fails() {
    let mut device = SoftDevice::new();
    let (_, _, list) = direct_list(&mut device);
    let error = device.record(list, Command::SetStencilRef(1)).unwrap_err();
    assert_eq!(error, DeviceError::CommandListClosed(list.0));
    assert_eq!(device.debug_messages()[0].kind, DebugMessageKind::RecordIntoClosedList);
}

#[test]
fn upload_copy_and_readback() {
    let mut device = SoftDevice::new();
    let queue = device.create_command_queue(QueueKind::Copy).unwrap();
    let allocator = device.create_command_allocator(QueueKind::Copy).unwrap();
    let list = device.create_command_list(QueueKind::Copy).unwrap();

    let desc = TextureDesc::texture_2d(2, 2, TextureFormat::Rgba8Unorm);
    let footprint = copyable_footprint(&desc);
    let staging = device.create_upload_buffer(footprint.total_bytes).unwrap();
    device.write_buffer(staging, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    device
        .write_buffer(staging, footprint.row_pitch, &[9, 10, 11, 12, 13, 14, 15, 16])
        .unwrap();

    let heap = device.create_heap(1 << 20).unwrap();
    let texture = device
        .create_placed_texture(heap, 0, &desc, ResourceState::CopyDest)
        .unwrap();

    device.reset_command_list(list, allocator).unwrap();
    device
        .record(
            list,
            Command::AliasingBarrier {
                before: None,
                after: texture,
            },
        )
        .unwrap();
    device
        .record(
            list,
            Command::CopyBufferToTexture {
                src: staging,
                footprint,
                dst: texture,
            },
        )
        .unwrap();
    device.close_command_list(list).unwrap();
    device.execute_command_list(queue, list).unwrap();

    assert_eq!(
        device.read_texture(texture).unwrap(),
        (1..=16).collect::<Vec<u8>>()
    );
    assert_eq!(device.texture_state(texture), Some(ResourceState::Common));
    assert!(device.debug_messages().is_empty());
}

#[test]
fn placed_texture_used_before_aliasing_barrier_is_reported() {
    let mut device = SoftDevice::new();
    let queue = device.create_command_queue(QueueKind::Copy).unwrap();
    let allocator = device.create_command_allocator(QueueKind::Copy).unwrap();
    let list = device.create_command_list(QueueKind::Copy).unwrap();
    let desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm);
    let footprint = copyable_footprint(&desc);
    let staging = device.create_upload_buffer(footprint.total_bytes).unwrap();
    let heap = device.create_heap(1 << 20).unwrap();
    let texture = device
        .create_placed_texture(heap, 0, &desc, ResourceState::CopyDest)
        .unwrap();

    device.reset_command_list(list, allocator).unwrap();
    device
        .record(
            list,
            Command::CopyBufferToTexture {
                src: staging,
                footprint,
                dst: texture,
            },
        )
        .unwrap();
    device.close_command_list(list).unwrap();
    device.execute_command_list(queue, list).unwrap();

    assert_eq!(
        device.debug_messages()[0].kind,
        DebugMessageKind::MissingAliasingBarrier
    );
}

#[test]
fn overlapping_placed_textures_are_reported() {
    let mut device = SoftDevice::new();
    let heap = device.create_heap(1 << 20).unwrap();
    let desc = TextureDesc::texture_2d(8, 8, TextureFormat::Rgba8Unorm);
    device
        .create_placed_texture(heap, 0, &desc, ResourceState::CopyDest)
        .unwrap();
    device
        .create_placed_texture(heap, 0, &desc, ResourceState::CopyDest)
        .unwrap();
    assert_eq!(
        device.debug_messages()[0].kind,
        DebugMessageKind::PlacedResourceOverlap
    );
}

#[test]
fn placed_texture_outside_the_heap_is_rejected() {
    let mut device = SoftDevice::new();
    let heap = device.create_heap(64 * 1024).unwrap();
    let desc = TextureDesc::texture_2d(8, 8, TextureFormat::Rgba8Unorm);
    let error = device
        .create_placed_texture(heap, 64 * 1024, &desc, ResourceState::CopyDest)
        .unwrap_err();
    assert!(matches!(error, DeviceError::InvalidArgument(_)));
}

#[test]
fn small_alignment_falls_back_for_large_textures() {
    let device = SoftDevice::new();
    let small = TextureDesc::texture_2d(64, 64, TextureFormat::Rgba8Unorm);
    let large = TextureDesc::texture_2d(256, 256, TextureFormat::Rgba8Unorm);

    let info = device.resource_allocation_info(&small, SMALL_RESOURCE_PLACEMENT_ALIGNMENT);
    assert_eq!(info.alignment, SMALL_RESOURCE_PLACEMENT_ALIGNMENT);
    assert_eq!(info.size, 64 * 64 * 4);

    let info = device.resource_allocation_info(&large, SMALL_RESOURCE_PLACEMENT_ALIGNMENT);
    assert_eq!(info.alignment, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT);
    assert_eq!(info.size, 256 * 256 * 4);
}

#[test]
fn destroying_a_texture_with_queued_work_is_reported() {
    let mut device = SoftDevice::with_latency(4);
    let (queue, allocator, list) = direct_list(&mut device);
    let desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm)
        .with_usage(TextureUsage::RENDER_TARGET | TextureUsage::SHADER_RESOURCE);
    let texture = device
        .create_committed_texture(&desc, ResourceState::RenderTarget, None)
        .unwrap();

    device.reset_command_list(list, allocator).unwrap();
    device
        .record(
            list,
            Command::TransitionBarrier {
                texture,
                before: ResourceState::RenderTarget,
                after: ResourceState::PixelShaderResource,
            },
        )
        .unwrap();
    device.close_command_list(list).unwrap();
    device.execute_command_list(queue, list).unwrap();
    device.destroy_texture(texture);

    assert_eq!(
        device.debug_messages()[0].kind,
        DebugMessageKind::DestroyedWhileInUse
    );
}

#[test]
fn clear_resolve_and_copy_region() {
    let mut device = SoftDevice::new();
    let (queue, allocator, list) = direct_list(&mut device);
    let rtv_heap = device
        .create_descriptor_heap(DescriptorHeapKind::Rtv, 4, false)
        .unwrap();

    let msaa_desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm)
        .with_usage(TextureUsage::RENDER_TARGET)
        .with_sample_count(2);
    let msaa = device
        .create_committed_texture(&msaa_desc, ResourceState::RenderTarget, None)
        .unwrap();
    let rtv = DescriptorHandle {
        heap: rtv_heap,
        index: 0,
    };
    device.create_render_target_view(msaa, rtv).unwrap();

    let plain_desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm).with_usage(
        TextureUsage::SHADER_RESOURCE | TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
    );
    let resolved = device
        .create_committed_texture(&plain_desc, ResourceState::ResolveDest, None)
        .unwrap();
    let small_desc = TextureDesc::texture_2d(2, 1, TextureFormat::Rgba8Unorm);
    let copy = device
        .create_committed_texture(&small_desc, ResourceState::CopyDest, None)
        .unwrap();

    device.reset_command_list(list, allocator).unwrap();
    for command in [
        Command::ClearRenderTarget {
            view: rtv,
            color: [1.0, 0.0, 0.0, 1.0],
        },
        Command::TransitionBarrier {
            texture: msaa,
            before: ResourceState::RenderTarget,
            after: ResourceState::ResolveSource,
        },
        Command::ResolveSubresource {
            src: msaa,
            dst: resolved,
        },
        Command::TransitionBarrier {
            texture: resolved,
            before: ResourceState::ResolveDest,
            after: ResourceState::CopySource,
        },
        Command::CopyTextureRegion {
            src: resolved,
            region: CopyRegion {
                x: 1,
                y: 1,
                width: 2,
                height: 1,
            },
            dst: copy,
            dst_x: 0,
            dst_y: 0,
        },
    ] {
        device.record(list, command).unwrap();
    }
    device.close_command_list(list).unwrap();
    device.execute_command_list(queue, list).unwrap();

    assert_eq!(device.read_texture(copy).unwrap(), vec![255, 0, 0, 255, 255, 0, 0, 255]);
    assert!(device.debug_messages().is_empty(), "{:?}", device.debug_messages());
}

#[test]
fn present_rotates_back_buffers_and_can_fail() {
    let mut device = SoftDevice::new();
    let queue = device.create_command_queue(QueueKind::Direct).unwrap();
    let swapchain = device.create_swapchain(queue, 8, 8, 3).unwrap();

    assert_eq!(device.current_back_buffer_index(swapchain).unwrap(), 0);
    device.present(swapchain, true).unwrap();
    assert_eq!(device.current_back_buffer_index(swapchain).unwrap(), 1);

    device.fail_next_presents(1);
    assert!(matches!(
        device.present(swapchain, true),
        Err(DeviceError::SwapchainUnavailable(_))
    ));
    assert_eq!(device.current_back_buffer_index(swapchain).unwrap(), 1);

    let before = device.swapchain_buffer(swapchain, 0).unwrap();
    device.resize_swapchain(swapchain, 16, 4).unwrap();
    let after = device.swapchain_buffer(swapchain, 0).unwrap();
    assert_ne!(before, after);
    assert_eq!(device.swapchain_size(swapchain), Some((16, 4)));
    assert!(device.resize_swapchain(swapchain, 0, 4).is_err());
}

#[test]
fn injected_creation_failures_are_consumed() {
    let mut device = SoftDevice::new();
    device.fail_next_creations(1);
    assert!(matches!(
        device.create_upload_buffer(64),
        Err(DeviceError::OutOfDeviceMemory { requested: 64 })
    ));
    assert!(device.create_upload_buffer(64).is_ok());
}
