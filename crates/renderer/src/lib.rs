//! Consumer-side frame renderer.
//!
//! Owns the committed layer tree's per-frame pipeline: three ordered
//! passes over the tree (animation/upload preparation, transform and
//! surface resolution, composition). The passes are pure planning — they
//! produce a [`FramePlan`] of draw operations that the GPU backend in
//! [`gpu`] executes, which keeps every compositing decision testable
//! without a device.

use geometry::{Rect, Size};
use layer_tree::LayerId;
use texture_cache::TextureCache;

pub use committed::{CommittedContent, CommittedLayer};
pub use plan::{DrawOp, FramePlan};
pub use surface::RendererSurface;

mod committed;
mod frame_composite;
mod frame_prepare;
mod frame_update;
pub mod gpu;
mod plan;
mod surface;

#[cfg(test)]
mod tests;

/// Per-frame view state supplied by the embedder. The visible and layout
/// rectangles are both in document coordinates; their divergence is the
/// scroll offset fixed-position math compensates for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Destination rectangle in the window, device pixels.
    pub target_rect: Rect,
    /// Clip applied to the whole scene, device pixels.
    pub clip_rect: Rect,
    /// Part of the document currently on screen.
    pub visible_rect: Rect,
    /// Layout viewport the page was laid out against.
    pub layout_rect: Rect,
    pub contents_size: Size,
    /// Document-to-device scale.
    pub scale: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            target_rect: Rect::default(),
            clip_rect: Rect::default(),
            visible_rect: Rect::default(),
            layout_rect: Rect::default(),
            contents_size: Size::default(),
            scale: 1.0,
        }
    }
}

/// CPU half of the renderer. GPU resources live in [`gpu::GpuRenderer`];
/// this type can run a full frame against a fake allocator in tests.
pub struct Renderer {
    pub(crate) cache: TextureCache,
    pub(crate) viewport: Viewport,
    /// Layers that need their own offscreen surface this frame, in
    /// traversal order. Rendered back-to-front in reverse so inner
    /// surfaces are ready before the surfaces that sample them.
    pub(crate) surface_order: Vec<LayerId>,
    pub(crate) debug_borders: bool,
}

impl Renderer {
    pub fn new(cache: TextureCache) -> Self {
        Self {
            cache,
            viewport: Viewport::default(),
            surface_order: Vec::new(),
            debug_borders: false,
        }
    }

    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TextureCache {
        &mut self.cache
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_debug_borders(&mut self, enabled: bool) {
        self.debug_borders = enabled;
    }
}
