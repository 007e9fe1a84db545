//! LRU cache of GPU-backed textures with byte-budget eviction.
//!
//! Textures live in a slotmap and are addressed by `TextureKey`; owners
//! (tiles, render surfaces) hold keys, never buffers. Eviction clears the
//! backing buffer inside the texture and defers the actual GPU free to a
//! garbage list, because eviction can run while no GPU context is current.
//! The protect counter is the only exclusion mechanism: a protected texture
//! is never evicted, and callers must balance every protect with an
//! unprotect.

use std::collections::HashMap;
use std::fmt;

use geometry::{Color, IntPoint, IntSize};
use slotmap::SlotMap;

slotmap::new_key_type! {
    pub struct TextureKey;
}

/// Opaque handle to a platform GPU buffer, minted by the `BufferAllocator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuBufferId(pub u64);

/// Backing policy requested from the platform graphics layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingPolicy {
    AlwaysBacked,
    BackedWhenNecessary,
    NeverBacked,
}

/// Seam to the platform graphics layer. Allocation may fail; destruction
/// must only be invoked while a GPU context is current, which is why the
/// cache routes most destruction through the garbage list.
pub trait BufferAllocator {
    fn allocate(&mut self, size: IntSize, policy: BackingPolicy) -> Option<GpuBufferId>;
    fn destroy(&mut self, buffer: GpuBufferId);

    /// Blit tightly packed RGBA8 pixels into a region of the buffer.
    fn upload(&mut self, buffer: GpuBufferId, pixels: &[u8], pixels_size: IntSize, origin: IntPoint);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureCacheError {
    UnknownTexture,
    UnprotectUnderflow,
}

impl fmt::Display for TextureCacheError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureCacheError::UnknownTexture => write!(formatter, "texture key is not tracked"),
            TextureCacheError::UnprotectUnderflow => {
                write!(formatter, "unprotect called on an unprotected texture")
            }
        }
    }
}

impl std::error::Error for TextureCacheError {}

#[derive(Debug)]
struct Texture {
    buffer: Option<GpuBufferId>,
    size: IntSize,
    bytes: usize,
    protect_count: u32,
    color: Option<Color>,
}

impl Texture {
    fn new() -> Self {
        Self {
            buffer: None,
            size: IntSize::default(),
            bytes: 0,
            protect_count: 0,
            color: None,
        }
    }
}

pub const DEFAULT_BUDGET_BYTES: usize = 64 * 1024 * 1024;

/// Distinct solid colors cached before the whole color map is cleared.
/// Bounds memory against adversarial content cycling through colors.
pub const COLOR_TEXTURE_CAP: usize = 100;

pub struct TextureCache {
    textures: SlotMap<TextureKey, Texture>,
    // Least recently used first. Color textures never appear here.
    lru: Vec<TextureKey>,
    color_textures: HashMap<Color, TextureKey>,
    garbage: Vec<GpuBufferId>,
    used_bytes: usize,
    budget_bytes: usize,
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET_BYTES)
    }
}

impl TextureCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            textures: SlotMap::with_key(),
            lru: Vec::new(),
            color_textures: HashMap::new(),
            garbage: Vec::new(),
            used_bytes: 0,
            budget_bytes,
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn set_budget_bytes(&mut self, budget_bytes: usize) {
        self.budget_bytes = budget_bytes;
        self.prune(self.budget_bytes);
    }

    /// Allocate a tracked texture handle with no backing buffer yet.
    pub fn create_texture(&mut self) -> TextureKey {
        let key = self.textures.insert(Texture::new());
        self.lru.push(key);
        key
    }

    pub fn is_tracked(&self, key: TextureKey) -> bool {
        self.textures.contains_key(key)
    }

    /// A texture is drawable only while it holds a buffer; an evicted
    /// texture must be re-installed (and re-rendered) before use.
    pub fn has_buffer(&self, key: TextureKey) -> bool {
        self.textures
            .get(key)
            .is_some_and(|texture| texture.buffer.is_some())
    }

    pub fn size_of(&self, key: TextureKey) -> Option<IntSize> {
        let texture = self.textures.get(key)?;
        texture.buffer.map(|_| texture.size)
    }

    pub fn buffer_of(&self, key: TextureKey) -> Option<GpuBufferId> {
        self.textures.get(key).and_then(|texture| texture.buffer)
    }

    pub fn protect(&mut self, key: TextureKey) {
        let texture = self
            .textures
            .get_mut(key)
            .unwrap_or_else(|| panic!("protect called with untracked texture key {key:?}"));
        texture.protect_count += 1;
    }

    pub fn unprotect(&mut self, key: TextureKey) -> Result<(), TextureCacheError> {
        let texture = self
            .textures
            .get_mut(key)
            .ok_or(TextureCacheError::UnknownTexture)?;
        if texture.protect_count == 0 {
            return Err(TextureCacheError::UnprotectUnderflow);
        }
        texture.protect_count -= 1;
        Ok(())
    }

    pub fn protect_count(&self, key: TextureKey) -> u32 {
        self.textures
            .get(key)
            .map(|texture| texture.protect_count)
            .unwrap_or(0)
    }

    /// Move the texture to the most-recently-used end. No-op for color
    /// textures, which are never evicted.
    pub fn texture_accessed(&mut self, key: TextureKey) {
        let Some(texture) = self.textures.get(key) else {
            return;
        };
        if texture.color.is_some() {
            return;
        }
        if let Some(position) = self.lru.iter().position(|entry| *entry == key) {
            self.lru.remove(position);
            self.lru.push(key);
        }
    }

    /// Ensure the texture has a buffer of `size`. Reallocates an evicted
    /// texture. Returns false only when the platform allocation fails, in
    /// which case the caller skips this unit of work for the frame and
    /// retries later (dirty state is not cleared on failure).
    pub fn install(
        &mut self,
        key: TextureKey,
        size: IntSize,
        policy: BackingPolicy,
        allocator: &mut dyn BufferAllocator,
    ) -> bool {
        let Some(texture) = self.textures.get(key) else {
            panic!("install called with untracked texture key {key:?}");
        };
        if texture.buffer.is_some() && texture.size == size {
            self.texture_accessed(key);
            return true;
        }
        if texture.buffer.is_some() {
            return self.resize(key, size, policy, allocator);
        }

        let Some(buffer) = allocator.allocate(size, policy) else {
            log::warn!(
                "texture buffer allocation failed for {}x{}; skipping this frame",
                size.width,
                size.height
            );
            return false;
        };
        let bytes = size.area_bytes_rgba8();
        let texture = self
            .textures
            .get_mut(key)
            .expect("texture vanished during install");
        texture.buffer = Some(buffer);
        texture.size = size;
        texture.bytes = bytes;
        self.used_bytes += bytes;
        self.texture_accessed(key);

        // Protect across the prune this insertion may trigger, otherwise a
        // just-created texture can be evicted before its first use.
        self.protect(key);
        self.prune(self.budget_bytes);
        self.unprotect(key)
            .expect("freshly protected texture must unprotect");
        true
    }

    /// Reallocate the buffer at a new size. The old buffer is destroyed
    /// immediately rather than deferred: resize only happens from the
    /// thread holding the GPU context, with the texture guaranteed unused.
    pub fn resize(
        &mut self,
        key: TextureKey,
        new_size: IntSize,
        policy: BackingPolicy,
        allocator: &mut dyn BufferAllocator,
    ) -> bool {
        let Some(texture) = self.textures.get(key) else {
            panic!("resize called with untracked texture key {key:?}");
        };
        if texture.buffer.is_some() && texture.size == new_size {
            self.texture_accessed(key);
            return true;
        }

        let Some(new_buffer) = allocator.allocate(new_size, policy) else {
            log::warn!(
                "texture resize allocation failed for {}x{}",
                new_size.width,
                new_size.height
            );
            return false;
        };
        let texture = self
            .textures
            .get_mut(key)
            .expect("texture vanished during resize");
        if let Some(old_buffer) = texture.buffer.take() {
            allocator.destroy(old_buffer);
            self.used_bytes -= texture.bytes;
        }
        let bytes = new_size.area_bytes_rgba8();
        texture.buffer = Some(new_buffer);
        texture.size = new_size;
        texture.bytes = bytes;
        self.used_bytes += bytes;
        self.texture_accessed(key);

        self.protect(key);
        self.prune(self.budget_bytes);
        self.unprotect(key)
            .expect("freshly protected texture must unprotect");
        true
    }

    /// Evict least-recently-used unprotected textures until usage fits
    /// `limit`. Stops early when nothing evictable remains; a fully
    /// protected cache may legitimately exceed the limit.
    pub fn prune(&mut self, limit: usize) {
        while self.used_bytes > limit {
            let candidate = self.lru.iter().copied().position(|key| {
                let texture = &self.textures[key];
                texture.protect_count == 0 && texture.bytes > 0
            });
            let Some(position) = candidate else {
                break;
            };
            let key = self.lru[position];
            self.evict(key);
        }
    }

    fn evict(&mut self, key: TextureKey) {
        let texture = self
            .textures
            .get_mut(key)
            .unwrap_or_else(|| panic!("evict called with untracked texture key {key:?}"));
        debug_assert_eq!(texture.protect_count, 0, "evicting a protected texture");
        if let Some(buffer) = texture.buffer.take() {
            // No GPU context may be current here; destruction is deferred.
            self.garbage.push(buffer);
        }
        self.used_bytes -= texture.bytes;
        texture.bytes = 0;
        texture.size = IntSize::default();
        if let Some(position) = self.lru.iter().position(|entry| *entry == key) {
            self.lru.remove(position);
        }
    }

    /// Stop tracking a texture entirely. Its buffer joins the garbage list.
    pub fn release(&mut self, key: TextureKey) {
        let Some(mut texture) = self.textures.remove(key) else {
            return;
        };
        if let Some(buffer) = texture.buffer.take() {
            self.garbage.push(buffer);
        }
        self.used_bytes -= texture.bytes;
        if let Some(position) = self.lru.iter().position(|entry| *entry == key) {
            self.lru.remove(position);
        }
        if let Some(color) = texture.color {
            self.color_textures.remove(&color);
        }
    }

    /// Drain the deferred-destruction list. Call only while a valid GPU
    /// context is current.
    pub fn collect_garbage(&mut self, allocator: &mut dyn BufferAllocator) {
        for buffer in self.garbage.drain(..) {
            allocator.destroy(buffer);
        }
    }

    pub fn garbage_len(&self) -> usize {
        self.garbage.len()
    }

    /// Cached 1x1 solid-color texture, shared across all color-fill draws.
    /// Never evicted and never counted against the LRU. Exceeding the cap
    /// clears the whole color map and starts over.
    pub fn texture_for_color(
        &mut self,
        color: Color,
        allocator: &mut dyn BufferAllocator,
    ) -> Option<TextureKey> {
        if let Some(key) = self.color_textures.get(&color) {
            return Some(*key);
        }

        if self.color_textures.len() >= COLOR_TEXTURE_CAP {
            log::debug!(
                "color texture cache exceeded {} entries; clearing",
                COLOR_TEXTURE_CAP
            );
            let stale: Vec<Color> = self.color_textures.keys().copied().collect();
            for stale_color in stale {
                if let Some(key) = self.color_textures.remove(&stale_color) {
                    self.release_color_texture(key);
                }
            }
        }

        let size = IntSize::new(1, 1);
        let buffer = allocator.allocate(size, BackingPolicy::AlwaysBacked)?;
        allocator.upload(
            buffer,
            &[color.red, color.green, color.blue, color.alpha],
            size,
            IntPoint::default(),
        );
        let key = self.textures.insert(Texture {
            buffer: Some(buffer),
            size,
            bytes: size.area_bytes_rgba8(),
            protect_count: 0,
            color: Some(color),
        });
        self.used_bytes += size.area_bytes_rgba8();
        self.color_textures.insert(color, key);
        Some(key)
    }

    pub fn color_of(&self, key: TextureKey) -> Option<Color> {
        self.textures.get(key).and_then(|texture| texture.color)
    }

    pub fn color_texture_count(&self) -> usize {
        self.color_textures.len()
    }

    fn release_color_texture(&mut self, key: TextureKey) {
        let Some(mut texture) = self.textures.remove(key) else {
            return;
        };
        if let Some(buffer) = texture.buffer.take() {
            self.garbage.push(buffer);
        }
        self.used_bytes -= texture.bytes;
    }
}
