use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counters for the renderer and its memory managers.
///
/// Shared between the managers through an `Arc`; cheap to bump on the render
/// thread and safe to read from another one with [`RendererStats::snapshot`].
#[derive(Debug, Default)]
pub struct RendererStats {
    frames: AtomicU64,
    draw_calls_submitted: AtomicU64,
    draw_calls_suppressed: AtomicU64,

    buffer_blocks_created: AtomicU64,
    buffer_blocks_reclaimed: AtomicU64,
    placed_textures: AtomicU64,
    committed_textures: AtomicU64,
    texture_uploads: AtomicU64,

    fence_waits: AtomicU64,
    deferred_frees: AtomicU64,
    swapchain_recreations: AtomicU64,
}

impl RendererStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draw_calls_submitted(&self) {
        self.draw_calls_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draw_calls_suppressed(&self) {
        self.draw_calls_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buffer_blocks_created(&self) {
        self.buffer_blocks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buffer_blocks_reclaimed(&self) {
        self.buffer_blocks_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_placed_textures(&self) {
        self.placed_textures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_committed_textures(&self) {
        self.committed_textures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_texture_uploads(&self) {
        self.texture_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fence_waits(&self) {
        self.fence_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_deferred_frees(&self, count: u64) {
        self.deferred_frees.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_swapchain_recreations(&self) {
        self.swapchain_recreations.fetch_add(1, Ordering::Relaxed);
    }

    /// `validation_failures` is owned by the [`crate::Validator`]; callers pass it in.
    pub fn snapshot_with(&self, validation_failures: u64) -> RendererStatsSnapshot {
        RendererStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            draw_calls_submitted: self.draw_calls_submitted.load(Ordering::Relaxed),
            draw_calls_suppressed: self.draw_calls_suppressed.load(Ordering::Relaxed),
            buffer_blocks_created: self.buffer_blocks_created.load(Ordering::Relaxed),
            buffer_blocks_reclaimed: self.buffer_blocks_reclaimed.load(Ordering::Relaxed),
            placed_textures: self.placed_textures.load(Ordering::Relaxed),
            committed_textures: self.committed_textures.load(Ordering::Relaxed),
            texture_uploads: self.texture_uploads.load(Ordering::Relaxed),
            fence_waits: self.fence_waits.load(Ordering::Relaxed),
            deferred_frees: self.deferred_frees.load(Ordering::Relaxed),
            swapchain_recreations: self.swapchain_recreations.load(Ordering::Relaxed),
            validation_failures,
        }
    }

    pub fn snapshot(&self) -> RendererStatsSnapshot {
        self.snapshot_with(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStatsSnapshot {
    pub frames: u64,
    pub draw_calls_submitted: u64,
    pub draw_calls_suppressed: u64,
    pub buffer_blocks_created: u64,
    pub buffer_blocks_reclaimed: u64,
    pub placed_textures: u64,
    pub committed_textures: u64,
    pub texture_uploads: u64,
    pub fence_waits: u64,
    pub deferred_frees: u64,
    pub swapchain_recreations: u64,
    pub validation_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = RendererStats::new();
        stats.inc_frames();
        stats.inc_frames();
        stats.inc_draw_calls_suppressed();
        stats.add_deferred_frees(3);

        let snapshot = stats.snapshot_with(7);
        assert_eq!(snapshot.frames, 2);
        assert_eq!(snapshot.draw_calls_suppressed, 1);
        assert_eq!(snapshot.draw_calls_submitted, 0);
        assert_eq!(snapshot.deferred_frees, 3);
        assert_eq!(snapshot.validation_failures, 7);
    }
}
