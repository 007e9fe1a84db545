//! Offscreen render targets for masked, replicated, or filtered layers.

use geometry::{IntSize, Matrix4};
use texture_cache::{BackingPolicy, BufferAllocator, TextureCache, TextureKey};

/// An offscreen target owned 1:1 by the layer that needs it. The layer's
/// subtree renders into `texture`; `draw_transform` then composites the
/// finished surface into the parent scene. Filtered surfaces also carry a
/// scratch texture for ping-pong passes.
#[derive(Debug)]
pub struct RendererSurface {
    texture: TextureKey,
    scratch: Option<TextureKey>,
    size: IntSize,
    /// Size the transform pass asked for; realized by `ensure_backing`
    /// during composition.
    pub(crate) requested_size: IntSize,
    pub draw_transform: Matrix4,
    pub replica_transform: Option<Matrix4>,
}

impl RendererSurface {
    pub fn new(cache: &mut TextureCache) -> Self {
        Self {
            texture: cache.create_texture(),
            scratch: None,
            size: IntSize::default(),
            requested_size: IntSize::default(),
            draw_transform: Matrix4::IDENTITY,
            replica_transform: None,
        }
    }

    pub fn texture(&self) -> TextureKey {
        self.texture
    }

    pub fn scratch(&self) -> Option<TextureKey> {
        self.scratch
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    /// Ensure the backing texture (and scratch, when filtering) exists at
    /// `size`. Returns false when allocation fails; the caller skips this
    /// surface for the frame and retries later.
    pub fn ensure_backing(
        &mut self,
        size: IntSize,
        needs_scratch: bool,
        cache: &mut TextureCache,
        allocator: &mut dyn BufferAllocator,
    ) -> bool {
        if size.is_empty() {
            return false;
        }
        if !cache.install(self.texture, size, BackingPolicy::AlwaysBacked, allocator) {
            return false;
        }
        self.size = size;
        if needs_scratch {
            let scratch = match self.scratch {
                Some(scratch) => scratch,
                None => {
                    let scratch = cache.create_texture();
                    self.scratch = Some(scratch);
                    scratch
                }
            };
            if !cache.install(scratch, size, BackingPolicy::AlwaysBacked, allocator) {
                return false;
            }
        }
        true
    }

    pub fn release(&mut self, cache: &mut TextureCache) {
        cache.release(self.texture);
        if let Some(scratch) = self.scratch.take() {
            cache.release(scratch);
        }
    }
}
