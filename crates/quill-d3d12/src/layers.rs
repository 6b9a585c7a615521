//! Offscreen layer framebuffers and the postprocess ping-pong targets.

use crate::device::{Command, DescriptorHandle, Device, ResourceState, TextureDesc, TextureId};
use crate::error::{AllocError, RenderError};
use crate::handles::LayerHandle;
use crate::memory::{SrvDescriptor, TextureMemoryManager, ViewDescriptor};

/// Which depth-stencil a colour framebuffer renders with.
///
/// The depth-stencil is owned by [`RenderLayerStack`]; framebuffers only name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedDepthStencil {
    /// Shared by every layer, multisampled.
    Layers,
    /// Shared by the postprocess targets, single-sampled.
    Postprocess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostprocessSlot {
    Primary,
    Secondary,
    Tertiary,
    BlendMask,
}

impl PostprocessSlot {
    pub const ALL: [PostprocessSlot; 4] = [
        PostprocessSlot::Primary,
        PostprocessSlot::Secondary,
        PostprocessSlot::Tertiary,
        PostprocessSlot::BlendMask,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A committed render-target or depth-stencil texture and its views.
///
/// The current resource state is tracked here so barriers are always
/// recorded with the right `before` state.
#[derive(Debug)]
pub struct FramebufferData {
    texture: Option<TextureId>,
    view: Option<ViewDescriptor>,
    srv: Option<SrvDescriptor>,
    desc: TextureDesc,
    layer_id: u32,
    state: ResourceState,
    depth_stencil: Option<SharedDepthStencil>,
}

impl FramebufferData {
    pub(crate) fn new(
        texture: TextureId,
        desc: TextureDesc,
        layer_id: u32,
        state: ResourceState,
        depth_stencil: Option<SharedDepthStencil>,
    ) -> Self {
        Self {
            texture: Some(texture),
            view: None,
            srv: None,
            desc,
            layer_id,
            state,
            depth_stencil,
        }
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    /// RTV for colour targets, DSV for depth-stencils.
    pub fn view(&self) -> Option<DescriptorHandle> {
        self.view.as_ref().map(ViewDescriptor::handle)
    }

    pub fn srv(&self) -> Option<DescriptorHandle> {
        self.srv.as_ref().map(SrvDescriptor::handle)
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    pub fn sample_count(&self) -> u32 {
        self.desc.sample_count
    }

    pub fn layer_id(&self) -> u32 {
        self.layer_id
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn depth_stencil(&self) -> Option<SharedDepthStencil> {
        self.depth_stencil
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.desc.format.is_depth_stencil()
    }

    pub fn is_released(&self) -> bool {
        self.texture.is_none()
    }

    /// Barrier moving the framebuffer into `after`, or `None` when it is
    /// already there.
    pub(crate) fn transition(&mut self, after: ResourceState) -> Option<Command> {
        let texture = self.texture?;
        if self.state == after {
            return None;
        }
        let before = std::mem::replace(&mut self.state, after);
        Some(Command::TransitionBarrier {
            texture,
            before,
            after,
        })
    }

    pub(crate) fn set_view(&mut self, view: ViewDescriptor) {
        self.view = Some(view);
    }

    pub(crate) fn set_srv(&mut self, srv: SrvDescriptor) {
        self.srv = Some(srv);
    }

    pub(crate) fn take_texture(&mut self) -> Option<TextureId> {
        self.texture.take()
    }

    pub(crate) fn take_view(&mut self) -> Option<ViewDescriptor> {
        self.view.take()
    }

    pub(crate) fn take_srv(&mut self) -> Option<SrvDescriptor> {
        self.srv.take()
    }
}

/// Stack of layer framebuffers for one frame.
///
/// Every frame starts with exactly the base layer pushed and must end with
/// only the base layer left. Popped layers keep their framebuffers for the
/// next push; everything is recreated when the frame size changes.
#[derive(Debug)]
pub struct RenderLayerStack {
    width: u32,
    height: u32,
    msaa_sample_count: u32,
    layers: Vec<FramebufferData>,
    layers_size: usize,
    layers_depth_stencil: Option<FramebufferData>,
    postprocess: [Option<FramebufferData>; 4],
    postprocess_depth_stencil: Option<FramebufferData>,
}

impl RenderLayerStack {
    pub fn new(msaa_sample_count: u32) -> Self {
        Self {
            width: 0,
            height: 0,
            msaa_sample_count: msaa_sample_count.max(1),
            layers: Vec::new(),
            layers_size: 0,
            layers_depth_stencil: None,
            postprocess: Default::default(),
            postprocess_depth_stencil: None,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Number of layers pushed in the current frame.
    pub fn layers_size(&self) -> usize {
        self.layers_size
    }

    /// Number of layer framebuffers kept for reuse.
    pub fn allocated_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn begin_frame<D: Device>(
        &mut self,
        device: &mut D,
        textures: &mut TextureMemoryManager,
        width: u32,
        height: u32,
    ) -> Result<LayerHandle, RenderError> {
        if self.layers_size != 0 {
            return Err(RenderError::InvalidState("layer stack is not empty at the start of a frame"));
        }
        if (width, height) != (self.width, self.height) {
            self.destroy_framebuffers(device, textures);
            self.width = width;
            self.height = height;
            tracing::debug!(width, height, "layer framebuffers resized");
        }
        Ok(self.push_layer(device, textures)?)
    }

    pub fn push_layer<D: Device>(
        &mut self,
        device: &mut D,
        textures: &mut TextureMemoryManager,
    ) -> Result<LayerHandle, AllocError> {
        if self.layers_size == self.layers.len() {
            if self.layers_depth_stencil.is_none() {
                let depth_stencil =
                    textures.alloc_depth_stencil(device, self.width, self.height, self.msaa_sample_count)?;
                self.layers_depth_stencil = Some(depth_stencil);
            }
            let layer = textures.alloc_render_target(
                device,
                self.width,
                self.height,
                self.msaa_sample_count,
                self.layers.len() as u32,
                Some(SharedDepthStencil::Layers),
            )?;
            self.layers.push(layer);
        }
        self.layers_size += 1;
        Ok(self.top_layer_handle())
    }

    /// Deactivates the top layer. The base layer can only be popped by
    /// [`RenderLayerStack::end_frame`].
    pub fn pop_layer(&mut self) -> Result<(), RenderError> {
        if self.layers_size <= 1 {
            return Err(RenderError::InvalidState("pop_layer without a matching push_layer"));
        }
        self.layers_size -= 1;
        Ok(())
    }

    pub fn end_frame(&mut self) -> Result<(), RenderError> {
        if self.layers_size != 1 {
            return Err(RenderError::InvalidState("layer pushes and pops are unbalanced at the end of the frame"));
        }
        self.layers_size = 0;
        Ok(())
    }

    pub fn top_layer_handle(&self) -> LayerHandle {
        LayerHandle::from(self.layers_size.saturating_sub(1) as u32)
    }

    pub fn top_layer(&self) -> Option<&FramebufferData> {
        self.layer(self.top_layer_handle())
    }

    /// Active layer behind `handle`.
    pub fn layer(&self, handle: LayerHandle) -> Option<&FramebufferData> {
        let index = handle.raw() as usize;
        (index < self.layers_size).then(|| &self.layers[index])
    }

    pub fn layer_mut(&mut self, handle: LayerHandle) -> Option<&mut FramebufferData> {
        let index = handle.raw() as usize;
        if index < self.layers_size {
            self.layers.get_mut(index)
        } else {
            None
        }
    }

    pub fn depth_stencil(&self, key: SharedDepthStencil) -> Option<&FramebufferData> {
        match key {
            SharedDepthStencil::Layers => self.layers_depth_stencil.as_ref(),
            SharedDepthStencil::Postprocess => self.postprocess_depth_stencil.as_ref(),
        }
    }

    /// The postprocess target in `slot`, created on first use.
    pub fn ensure_postprocess<D: Device>(
        &mut self,
        device: &mut D,
        textures: &mut TextureMemoryManager,
        slot: PostprocessSlot,
    ) -> Result<&mut FramebufferData, AllocError> {
        if self.postprocess_depth_stencil.is_none() {
            let depth_stencil = textures.alloc_depth_stencil(device, self.width, self.height, 1)?;
            self.postprocess_depth_stencil = Some(depth_stencil);
        }
        let entry = &mut self.postprocess[slot.index()];
        if entry.is_none() {
            let framebuffer = textures.alloc_render_target(
                device,
                self.width,
                self.height,
                1,
                slot.index() as u32,
                Some(SharedDepthStencil::Postprocess),
            )?;
            *entry = Some(framebuffer);
        }
        entry
            .as_mut()
            .ok_or(AllocError::AlreadyAllocated("postprocess framebuffer"))
    }

    pub fn postprocess(&self, slot: PostprocessSlot) -> Option<&FramebufferData> {
        self.postprocess[slot.index()].as_ref()
    }

    pub fn postprocess_mut(&mut self, slot: PostprocessSlot) -> Option<&mut FramebufferData> {
        self.postprocess[slot.index()].as_mut()
    }

    pub fn swap_postprocess_primary_secondary(&mut self) {
        self.postprocess.swap(
            PostprocessSlot::Primary.index(),
            PostprocessSlot::Secondary.index(),
        );
    }

    /// Frees every framebuffer. The caller makes sure the GPU is done with them.
    pub fn destroy_framebuffers<D: Device>(&mut self, device: &mut D, textures: &mut TextureMemoryManager) {
        for mut layer in self.layers.drain(..) {
            textures.free_framebuffer(device, &mut layer);
        }
        for slot in &mut self.postprocess {
            if let Some(mut framebuffer) = slot.take() {
                textures.free_framebuffer(device, &mut framebuffer);
            }
        }
        for depth_stencil in [&mut self.layers_depth_stencil, &mut self.postprocess_depth_stencil] {
            if let Some(mut framebuffer) = depth_stencil.take() {
                textures.free_framebuffer(device, &mut framebuffer);
            }
        }
        self.layers_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::TextureMemoryConfig;
    use crate::soft::SoftDevice;

    fn setup() -> (SoftDevice, TextureMemoryManager, RenderLayerStack) {
        let mut device = SoftDevice::new();
        let textures = TextureMemoryManager::new(
            &mut device,
            TextureMemoryConfig::default(),
            Duration::from_secs(1),
            Arc::default(),
        )
        .unwrap();
        (device, textures, RenderLayerStack::new(2))
    }

    #[test]
    fn frame_starts_with_the_base_layer() {
        let (mut device, mut textures, mut stack) = setup();
        let base = stack.begin_frame(&mut device, &mut textures, 32, 16).unwrap();
        assert_eq!(base.raw(), 0);
        assert_eq!(stack.layers_size(), 1);
        let layer = stack.top_layer().unwrap();
        assert_eq!(layer.dimensions(), (32, 16));
        assert_eq!(layer.sample_count(), 2);
        assert_eq!(layer.depth_stencil(), Some(SharedDepthStencil::Layers));
        assert!(stack.depth_stencil(SharedDepthStencil::Layers).is_some());
        stack.end_frame().unwrap();
    }

    #[test]
    fn popped_layers_are_reused() {
        let (mut device, mut textures, mut stack) = setup();
        stack.begin_frame(&mut device, &mut textures, 8, 8).unwrap();
        let first = stack.push_layer(&mut device, &mut textures).unwrap();
        let first_texture = stack.layer(first).unwrap().texture();
        stack.pop_layer().unwrap();
        let again = stack.push_layer(&mut device, &mut textures).unwrap();
        assert_eq!(first, again);
        assert_eq!(stack.layer(again).unwrap().texture(), first_texture);
        assert_eq!(stack.allocated_layers(), 2);
        stack.pop_layer().unwrap();
        stack.end_frame().unwrap();
    }

    #[test]
    fn unbalanced_frames_are_rejected() {
        let (mut device, mut textures, mut stack) = setup();
        stack.begin_frame(&mut device, &mut textures, 8, 8).unwrap();
        assert!(stack.pop_layer().is_err());
        stack.push_layer(&mut device, &mut textures).unwrap();
        assert!(stack.end_frame().is_err());
        assert!(stack.begin_frame(&mut device, &mut textures, 8, 8).is_err());
        stack.pop_layer().unwrap();
        stack.end_frame().unwrap();
    }

    #[test]
    fn inactive_layers_are_not_addressable() {
        let (mut device, mut textures, mut stack) = setup();
        stack.begin_frame(&mut device, &mut textures, 8, 8).unwrap();
        let layer = stack.push_layer(&mut device, &mut textures).unwrap();
        stack.pop_layer().unwrap();
        assert!(stack.layer(layer).is_none());
        stack.end_frame().unwrap();
    }

    #[test]
    fn resize_recreates_framebuffers() {
        let (mut device, mut textures, mut stack) = setup();
        stack.begin_frame(&mut device, &mut textures, 8, 8).unwrap();
        stack.ensure_postprocess(&mut device, &mut textures, PostprocessSlot::Primary).unwrap();
        stack.end_frame().unwrap();
        // base layer, layer depth-stencil, primary, postprocess depth-stencil
        assert_eq!(device.live_texture_count(), 4);

        stack.begin_frame(&mut device, &mut textures, 16, 4).unwrap();
        assert_eq!(stack.top_layer().unwrap().dimensions(), (16, 4));
        assert!(stack.postprocess(PostprocessSlot::Primary).is_none());
        assert_eq!(device.live_texture_count(), 2);
        stack.end_frame().unwrap();
    }

    #[test]
    fn postprocess_swap_exchanges_targets() {
        let (mut device, mut textures, mut stack) = setup();
        stack.begin_frame(&mut device, &mut textures, 8, 8).unwrap();
        let primary = stack
            .ensure_postprocess(&mut device, &mut textures, PostprocessSlot::Primary)
            .unwrap()
            .texture();
        let secondary = stack
            .ensure_postprocess(&mut device, &mut textures, PostprocessSlot::Secondary)
            .unwrap()
            .texture();
        stack.swap_postprocess_primary_secondary();
        assert_eq!(stack.postprocess(PostprocessSlot::Primary).unwrap().texture(), secondary);
        assert_eq!(stack.postprocess(PostprocessSlot::Secondary).unwrap().texture(), primary);
        assert_eq!(stack.postprocess(PostprocessSlot::Primary).unwrap().sample_count(), 1);
        stack.end_frame().unwrap();
    }

    #[test]
    fn transitions_track_state() {
        let (mut device, mut textures, mut stack) = setup();
        let base = stack.begin_frame(&mut device, &mut textures, 8, 8).unwrap();
        let layer = stack.layer_mut(base).unwrap();
        assert_eq!(layer.transition(ResourceState::RenderTarget), None);
        let barrier = layer.transition(ResourceState::ResolveSource).unwrap();
        assert!(matches!(
            barrier,
            Command::TransitionBarrier {
                before: ResourceState::RenderTarget,
                after: ResourceState::ResolveSource,
                ..
            }
        ));
        assert_eq!(layer.state(), ResourceState::ResolveSource);
        stack.end_frame().unwrap();
    }
}
