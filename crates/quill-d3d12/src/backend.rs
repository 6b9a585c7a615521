//! The per-window backend context: owns a [`RenderInterface`] and the source
//! of the window size, and waits out minimised windows before a frame.

use std::time::Duration;

use crate::config::{RendererConfig, SWAPCHAIN_POLL_INTERVAL};
use crate::device::Device;
use crate::error::RenderError;
use crate::renderer::RenderInterface;

/// Reports the client-area size of the window being rendered to.
pub trait WindowSize {
    fn window_size(&mut self) -> (u32, u32);
}

impl<F: FnMut() -> (u32, u32)> WindowSize for F {
    fn window_size(&mut self) -> (u32, u32) {
        self()
    }
}

#[derive(Debug)]
pub struct Backend<D: Device, W: WindowSize> {
    renderer: RenderInterface<D>,
    window: W,
    poll_interval: Duration,
    /// Polls before giving up on a minimised window; unbounded when `None`.
    poll_limit: Option<usize>,
}

impl<D: Device, W: WindowSize> Backend<D, W> {
    /// Creates the render interface and sizes its swapchain to the window.
    pub fn new(device: D, config: RendererConfig, mut window: W) -> Result<Self, RenderError> {
        let mut renderer = RenderInterface::new(device, config)?;
        let (width, height) = window.window_size();
        renderer.set_viewport(width, height)?;
        Ok(Self {
            renderer,
            window,
            poll_interval: SWAPCHAIN_POLL_INTERVAL,
            poll_limit: None,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_limit(mut self, limit: usize) -> Self {
        self.poll_limit = Some(limit);
        self
    }

    pub fn renderer(&self) -> &RenderInterface<D> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut RenderInterface<D> {
        &mut self.renderer
    }

    /// Forwards a window resize to the swapchain.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.renderer.set_viewport(width, height)
    }

    /// Begins a frame. While the swapchain is unusable this sleeps and polls
    /// the window until it has an area again, then recreates the swapchain.
    pub fn begin_frame(&mut self) -> Result<(), RenderError> {
        let mut polls = 0;
        loop {
            match self.renderer.begin_frame() {
                Err(RenderError::SwapchainInvalid { .. }) => {}
                result => return result,
            }

            let (width, height) = self.window.window_size();
            if width > 0 && height > 0 {
                tracing::debug!(width, height, "window usable again; recreating swapchain");
                self.renderer.set_viewport(width, height)?;
                continue;
            }

            polls += 1;
            if self.poll_limit.is_some_and(|limit| polls >= limit) {
                return Err(RenderError::SwapchainInvalid { width, height });
            }
            tracing::trace!(polls, "window has no area; waiting");
            std::thread::sleep(self.poll_interval);
        }
    }

    pub fn end_frame(&mut self) -> Result<(), RenderError> {
        self.renderer.end_frame()
    }

    pub fn shutdown(&mut self) {
        self.renderer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::soft::SoftDevice;
    use crate::validation::ValidationMode;

    fn config() -> RendererConfig {
        RendererConfig {
            validation: ValidationMode::Log,
            preallocated_constant_buffers: 4,
            ..RendererConfig::default()
        }
    }

    #[test]
    fn minimised_window_is_waited_out() {
        let polls = Rc::new(Cell::new(0));
        let counter = polls.clone();
        let mut sizes = vec![(64, 48), (0, 0), (0, 0), (80, 60)].into_iter();
        let window = move || {
            counter.set(counter.get() + 1);
            sizes.next().unwrap_or((80, 60))
        };
        let mut backend = Backend::new(SoftDevice::new(), config(), window)
            .unwrap()
            .with_poll_interval(Duration::ZERO);

        backend.begin_frame().unwrap();
        backend.end_frame().unwrap();

        backend.resize(0, 0).unwrap();
        backend.begin_frame().unwrap();
        backend.end_frame().unwrap();

        assert_eq!(polls.get(), 4);
        assert_eq!(backend.renderer().viewport(), (80, 60));
        assert!(backend.renderer().is_swapchain_valid());
        assert_eq!(backend.renderer().stats().frames, 2);
    }

    #[test]
    fn poll_limit_gives_up_on_a_window_that_never_returns() {
        let mut backend = Backend::new(SoftDevice::new(), config(), || (0, 0))
            .unwrap()
            .with_poll_interval(Duration::ZERO)
            .with_poll_limit(3);
        assert_eq!(
            backend.begin_frame(),
            Err(RenderError::SwapchainInvalid { width: 0, height: 0 })
        );
        assert!(!backend.renderer().in_frame());
    }

    #[test]
    fn shutdown_leaves_no_device_objects() {
        let mut backend = Backend::new(SoftDevice::new(), config(), || (32, 32)).unwrap();
        backend.begin_frame().unwrap();
        backend.end_frame().unwrap();
        backend.shutdown();
        assert_eq!(backend.renderer().device().live_texture_count(), 0);
        assert_eq!(backend.renderer().device().live_buffer_count(), 0);
    }
}
