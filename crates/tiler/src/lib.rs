//! Tiled backing store for a layer's painted content.
//!
//! A layer's content is split into a grid of fixed-size tiles, each backed
//! by one cache texture. The tiler straddles both threads: the producer
//! half accumulates dirty rects and paints pixel buffers, the consumer half
//! applies queued texture jobs and enumerates drawable tiles. The two
//! halves communicate through a job channel flushed once per commit and a
//! latest-wins visibility snapshot flowing the other way.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use geometry::{IntPoint, IntRect, IntSize};
use texture_cache::{BackingPolicy, BufferAllocator, TextureCache, TextureKey};

pub use bitset::TileBitset;
pub use latest_cell::LatestCell;

mod bitset;
mod latest_cell;

pub const TILE_SIZE: u32 = 256;

/// Largest single texture dimension the tiler will request; layer content
/// larger than this is scaled down into the available texture space.
pub const MAX_TEXTURE_DIMENSION: u32 = 2048;

/// Viewport inflation factors. Vertical gets the wider margin because page
/// scrolling is predominantly vertical; tiles just below the viewport are
/// pre-rendered ahead of the scroll.
pub const VIEWPORT_INFLATION_X: f32 = 1.5;
pub const VIEWPORT_INFLATION_Y: f32 = 2.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub i: u32,
    pub j: u32,
}

impl TileIndex {
    pub const fn new(i: u32, j: u32) -> Self {
        Self { i, j }
    }

    pub fn origin(self) -> IntPoint {
        IntPoint::new((self.i * TILE_SIZE) as i32, (self.j * TILE_SIZE) as i32)
    }
}

/// Rect of a tile in texture space, clamped to the overall texture size.
pub fn tile_rect(index: TileIndex, texture_size: IntSize) -> IntRect {
    let origin = index.origin();
    let width = (texture_size.width as i32 - origin.x).clamp(0, TILE_SIZE as i32) as u32;
    let height = (texture_size.height as i32 - origin.y).clamp(0, TILE_SIZE as i32) as u32;
    IntRect::new(origin.x, origin.y, width, height)
}

pub fn tile_count_for_size(texture_size: IntSize) -> (u32, u32) {
    (
        texture_size.width.div_ceil(TILE_SIZE),
        texture_size.height.div_ceil(TILE_SIZE),
    )
}

/// Tile indices whose rects intersect `rect`, clamped to the grid.
pub fn indices_intersecting(rect: IntRect, texture_size: IntSize) -> Vec<TileIndex> {
    let clamped = rect.intersection(IntRect::from_size(texture_size));
    if clamped.is_empty() {
        return Vec::new();
    }
    let first_i = clamped.min_x() as u32 / TILE_SIZE;
    let first_j = clamped.min_y() as u32 / TILE_SIZE;
    let last_i = (clamped.max_x() - 1) as u32 / TILE_SIZE;
    let last_j = (clamped.max_y() - 1) as u32 / TILE_SIZE;
    let mut indices = Vec::new();
    for j in first_j..=last_j {
        for i in first_i..=last_i {
            indices.push(TileIndex::new(i, j));
        }
    }
    indices
}

/// Tightly packed RGBA8 pixels produced by a paint call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub size: IntSize,
    pub bytes: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(size: IntSize, bytes: Vec<u8>) -> Self {
        assert_eq!(
            bytes.len(),
            size.area_bytes_rgba8(),
            "pixel buffer length does not match {}x{}",
            size.width,
            size.height
        );
        Self { size, bytes }
    }

    pub fn filled(size: IntSize, value: u8) -> Self {
        Self {
            size,
            bytes: vec![value; size.area_bytes_rgba8()],
        }
    }
}

/// Paint callback into the page's rendering pipeline. `rect` is in texture
/// space (layer pixels already multiplied by `scale`). Returning `None`
/// means the paint could not run this pass; the dirty state is kept and
/// the paint retried later.
pub trait ContentPainter {
    fn paint(&mut self, rect: IntRect, scale: f32) -> Option<PixelBuffer>;
}

/// One unit of cross-thread tile work. Jobs carrying pixels supersede
/// earlier pixel jobs for the same tile; `Resize` prunes out-of-bounds
/// tiles and invalidates stale jobs queued before it.
#[derive(Debug)]
pub enum TextureJob {
    /// Whole-texture repaint: one buffer covering the full required size.
    /// `single_tile` keeps the contents in one texture instead of
    /// splitting them into the grid.
    SetContents {
        contents: PixelBuffer,
        scale: f32,
        single_tile: bool,
    },
    /// Partial repaint of a single tile.
    UpdateTile {
        index: TileIndex,
        contents: PixelBuffer,
        scale: f32,
    },
    /// Required texture size changed.
    ResizeContents { size: IntSize },
    /// Mark an existing tile's texture stale without replacing it. Used
    /// when a growing dirty rect means a full repaint is imminent, to
    /// avoid racing partial uploads against it.
    DirtyTile { index: TileIndex },
    /// Drop all tiles and their textures.
    DiscardContents,
}

/// Published by the consumer thread after each draw pass; swapped in by
/// the producer on its next update so it repaints exactly what the
/// consumer could not draw.
#[derive(Debug, Clone, Default)]
pub struct VisibilitySnapshot {
    pub visible_rect: IntRect,
    pub needs_render: Vec<TileIndex>,
}

/// A drawable tile for the current frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileDraw {
    pub index: TileIndex,
    pub texture: TextureKey,
    pub rect: IntRect,
}

#[derive(Debug)]
struct Tile {
    texture: Option<TextureKey>,
    dirty: bool,
    content_scale: f32,
}

/// Create a connected producer/consumer pair for one layer.
pub fn tiler_pair(contents_size: IntSize) -> (TilerProducer, TilerConsumer) {
    let (job_sender, job_receiver) = unbounded();
    let visibility = Arc::new(LatestCell::new());
    let producer = TilerProducer {
        contents_size,
        required_texture_size: IntSize::default(),
        scale: 1.0,
        dirty_rect: IntRect::default(),
        dirty_all: true,
        render_full_contents: false,
        single_tile_only: false,
        needs_render: TileBitset::empty(),
        last_visible_rect: IntRect::default(),
        pending_jobs: Vec::new(),
        job_sender,
        visibility: visibility.clone(),
    };
    let consumer = TilerConsumer {
        required_texture_size: IntSize::default(),
        tiles: std::collections::HashMap::new(),
        single_texture: false,
        job_receiver,
        visibility,
        last_needs_render: 0,
    };
    (producer, consumer)
}

/// Producer-thread half: dirty tracking and paint scheduling.
pub struct TilerProducer {
    contents_size: IntSize,
    required_texture_size: IntSize,
    scale: f32,
    dirty_rect: IntRect,
    dirty_all: bool,
    render_full_contents: bool,
    single_tile_only: bool,
    needs_render: TileBitset,
    last_visible_rect: IntRect,
    pending_jobs: Vec<TextureJob>,
    job_sender: Sender<TextureJob>,
    visibility: Arc<LatestCell<VisibilitySnapshot>>,
}

impl TilerProducer {
    pub fn contents_size(&self) -> IntSize {
        self.contents_size
    }

    pub fn set_contents_size(&mut self, contents_size: IntSize) {
        if self.contents_size == contents_size {
            return;
        }
        self.contents_size = contents_size;
        self.dirty_all = true;
    }

    /// Mask layers and layers with active filters must always hold their
    /// complete content: a partially rendered mask or filter source is
    /// visibly wrong, so visibility culling is bypassed for them.
    pub fn set_render_full_contents(&mut self, render_full_contents: bool) {
        self.render_full_contents = render_full_contents;
    }

    /// Keep the whole content in one texture regardless of size. Mask
    /// sources need this: a mask samples as a single texture, so grid
    /// tiling would leave it unusable.
    pub fn set_single_tile_only(&mut self, single_tile_only: bool) {
        if self.single_tile_only == single_tile_only {
            return;
        }
        self.single_tile_only = single_tile_only;
        self.dirty_all = true;
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty_all = true;
        self.dirty_rect = IntRect::default();
        // A full invalidation supersedes every queued needs-render marker;
        // merging them back in would resurrect stale state.
        self.needs_render.clear_all();
    }

    /// Accumulate a dirty rect in layer coordinates. A union, not a list,
    /// so the pending state stays bounded.
    pub fn mark_dirty(&mut self, rect: IntRect) {
        if rect.is_empty() {
            return;
        }
        self.dirty_rect = self.dirty_rect.union(rect);
    }

    pub fn has_pending_work(&self) -> bool {
        self.dirty_all || !self.dirty_rect.is_empty() || self.needs_render.any()
    }

    fn required_size_for_scale(&self, scale: f32) -> IntSize {
        let width = ((self.contents_size.width as f32 * scale).ceil() as u32)
            .min(MAX_TEXTURE_DIMENSION);
        let height = ((self.contents_size.height as f32 * scale).ceil() as u32)
            .min(MAX_TEXTURE_DIMENSION);
        IntSize::new(width, height)
    }

    fn merge_visibility_snapshot(&mut self) {
        let Some(snapshot) = self.visibility.take() else {
            return;
        };
        self.last_visible_rect = snapshot.visible_rect;
        if self.dirty_all {
            // The whole layer is being repainted anyway; the snapshot's
            // needs-render markers predate the invalidation.
            return;
        }
        for index in snapshot.needs_render {
            self.needs_render.set(index);
        }
    }

    /// Decide what to repaint and queue the resulting texture jobs.
    /// Paint failures leave the dirty state intact for the next pass.
    pub fn update_if_needed(&mut self, painter: &mut dyn ContentPainter, scale: f32) {
        self.merge_visibility_snapshot();

        if self.contents_size.is_empty() {
            if self.required_texture_size != IntSize::default() {
                self.required_texture_size = IntSize::default();
                self.pending_jobs.push(TextureJob::DiscardContents);
            }
            self.dirty_all = false;
            self.dirty_rect = IntRect::default();
            return;
        }

        let required = self.required_size_for_scale(scale);
        if required != self.required_texture_size || scale != self.scale {
            self.required_texture_size = required;
            self.scale = scale;
            self.pending_jobs
                .push(TextureJob::ResizeContents { size: required });
            self.dirty_all = true;
            let (across, down) = tile_count_for_size(required);
            self.needs_render = TileBitset::new(across, down);
        }

        if !self.dirty_all && self.dirty_rect.is_empty() && !self.needs_render.any() {
            return;
        }

        let texture_rect = IntRect::from_size(required);
        if self.dirty_all || self.single_tile_only {
            let Some(contents) = painter.paint(texture_rect, scale) else {
                return;
            };
            self.pending_jobs.push(TextureJob::SetContents {
                contents,
                scale,
                single_tile: self.single_tile_only,
            });
            self.dirty_all = false;
            self.dirty_rect = IntRect::default();
            self.needs_render.clear_all();
            return;
        }

        // Partial repaint: tiles intersecting the dirty rect plus tiles
        // the consumer reported as needing render, restricted to the
        // visible region unless this layer must keep full contents.
        let dirty_texture_rect = self
            .dirty_rect
            .to_rect()
            .scaled(scale)
            .enclosing_int_rect()
            .intersection(texture_rect);
        let mut candidates: HashSet<TileIndex> =
            indices_intersecting(dirty_texture_rect, required)
                .into_iter()
                .collect();
        candidates.extend(self.needs_render.iter_set());

        for index in candidates {
            let rect = tile_rect(index, required);
            if rect.is_empty() {
                self.needs_render.unset(index);
                continue;
            }
            if !self.render_full_contents
                && !self.last_visible_rect.is_empty()
                && !rect.intersects(self.last_visible_rect)
            {
                // Not worth painting while offscreen. Tell the consumer
                // its copy is stale; it reports the tile back through the
                // visibility snapshot once the tile scrolls into view.
                self.pending_jobs.push(TextureJob::DirtyTile { index });
                self.needs_render.unset(index);
                continue;
            }
            let Some(contents) = painter.paint(rect, scale) else {
                // Keep the tile queued so the paint is retried next pass.
                self.needs_render.set(index);
                continue;
            };
            self.pending_jobs.push(TextureJob::UpdateTile {
                index,
                contents,
                scale,
            });
            self.needs_render.unset(index);
        }
        self.dirty_rect = IntRect::default();
    }

    /// Move accumulated jobs into the cross-thread queue. Called once per
    /// commit while the producer thread holds the commit rendezvous.
    pub fn commit_pending_jobs(&mut self) {
        for job in self.pending_jobs.drain(..) {
            if self.job_sender.send(job).is_err() {
                log::warn!("tiler consumer dropped; discarding pending texture jobs");
                return;
            }
        }
    }

    pub fn pending_job_count(&self) -> usize {
        self.pending_jobs.len()
    }
}

/// Consumer-thread half: applies jobs and enumerates drawable tiles.
pub struct TilerConsumer {
    required_texture_size: IntSize,
    tiles: std::collections::HashMap<TileIndex, Tile>,
    /// True once a single-tile `SetContents` has been applied: the whole
    /// content lives in one texture at index (0, 0).
    single_texture: bool,
    job_receiver: Receiver<TextureJob>,
    visibility: Arc<LatestCell<VisibilitySnapshot>>,
    last_needs_render: usize,
}

impl std::fmt::Debug for TilerConsumer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TilerConsumer")
            .field("required_texture_size", &self.required_texture_size)
            .field("tile_count", &self.tiles.len())
            .field("single_texture", &self.single_texture)
            .finish_non_exhaustive()
    }
}

impl TilerConsumer {
    pub fn required_texture_size(&self) -> IntSize {
        self.required_texture_size
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile_texture(&self, index: TileIndex) -> Option<TextureKey> {
        self.tiles.get(&index).and_then(|tile| tile.texture)
    }

    pub fn tile_is_dirty(&self, index: TileIndex) -> bool {
        self.tiles.get(&index).is_some_and(|tile| tile.dirty)
    }

    /// Drain the job queue and realize uploads. Jobs are applied in queue
    /// order, except that a pixel job superseded by a later pixel job for
    /// the same tile is dropped without uploading. Returns true when any
    /// job was applied.
    pub fn upload_if_needed(
        &mut self,
        cache: &mut TextureCache,
        allocator: &mut dyn BufferAllocator,
    ) -> bool {
        let jobs: Vec<TextureJob> = self.job_receiver.try_iter().collect();
        if jobs.is_empty() {
            return false;
        }

        // Identify the winning (last) pixel job per tile. SetContents
        // resets the winner map: it supersedes everything before it.
        let mut last_pixel_job: std::collections::HashMap<TileIndex, usize> =
            std::collections::HashMap::new();
        let mut last_set_contents: Option<usize> = None;
        for (position, job) in jobs.iter().enumerate() {
            match job {
                TextureJob::UpdateTile { index, .. } => {
                    last_pixel_job.insert(*index, position);
                }
                TextureJob::SetContents { .. } => {
                    last_set_contents = Some(position);
                    last_pixel_job.clear();
                }
                _ => {}
            }
        }

        for (position, job) in jobs.into_iter().enumerate() {
            match job {
                TextureJob::ResizeContents { size } => {
                    self.required_texture_size = size;
                    self.prune_out_of_bounds_tiles(cache);
                }
                TextureJob::DiscardContents => {
                    for (_, tile) in self.tiles.drain() {
                        if let Some(texture) = tile.texture {
                            cache.release(texture);
                        }
                    }
                    self.required_texture_size = IntSize::default();
                    self.single_texture = false;
                }
                TextureJob::DirtyTile { index } => {
                    if let Some(tile) = self.tiles.get_mut(&index) {
                        tile.dirty = true;
                    }
                }
                TextureJob::SetContents {
                    contents,
                    scale,
                    single_tile,
                } => {
                    if Some(position) != last_set_contents {
                        continue;
                    }
                    if single_tile {
                        self.apply_single_texture(contents, scale, cache, allocator);
                    } else {
                        self.apply_full_contents(contents, scale, cache, allocator);
                    }
                }
                TextureJob::UpdateTile {
                    index,
                    contents,
                    scale,
                } => {
                    if last_pixel_job.get(&index) != Some(&position) {
                        // Superseded by a later job; drop the pixels
                        // without uploading.
                        continue;
                    }
                    self.apply_tile_contents(index, contents, scale, cache, allocator);
                }
            }
        }
        true
    }

    fn prune_out_of_bounds_tiles(&mut self, cache: &mut TextureCache) {
        let required = self.required_texture_size;
        let stale: Vec<TileIndex> = self
            .tiles
            .keys()
            .copied()
            .filter(|index| tile_rect(*index, required).is_empty())
            .collect();
        for index in stale {
            if let Some(tile) = self.tiles.remove(&index) {
                if let Some(texture) = tile.texture {
                    cache.release(texture);
                }
            }
        }
    }

    fn apply_full_contents(
        &mut self,
        contents: PixelBuffer,
        scale: f32,
        cache: &mut TextureCache,
        allocator: &mut dyn BufferAllocator,
    ) {
        if contents.size != self.required_texture_size {
            // Stale job from before a resize.
            return;
        }
        if self.single_texture {
            // Leaving single-texture mode; the (0, 0) full-size texture
            // gets reinstalled at tile size below.
            self.single_texture = false;
        }
        let (across, down) = tile_count_for_size(self.required_texture_size);
        for j in 0..down {
            for i in 0..across {
                let index = TileIndex::new(i, j);
                let rect = tile_rect(index, self.required_texture_size);
                let tile_pixels = extract_subrect(&contents, rect);
                self.apply_tile_contents(index, tile_pixels, scale, cache, allocator);
            }
        }
    }

    /// Install the whole content as one texture at index (0, 0),
    /// regardless of how many grid tiles the size would normally span.
    fn apply_single_texture(
        &mut self,
        contents: PixelBuffer,
        scale: f32,
        cache: &mut TextureCache,
        allocator: &mut dyn BufferAllocator,
    ) {
        if contents.size != self.required_texture_size {
            // Stale job from before a resize.
            return;
        }
        let origin = TileIndex::new(0, 0);
        let stale: Vec<TileIndex> = self
            .tiles
            .keys()
            .copied()
            .filter(|index| *index != origin)
            .collect();
        for index in stale {
            if let Some(tile) = self.tiles.remove(&index) {
                if let Some(texture) = tile.texture {
                    cache.release(texture);
                }
            }
        }
        self.single_texture = true;
        self.install_tile(origin, contents, scale, cache, allocator);
    }

    fn apply_tile_contents(
        &mut self,
        index: TileIndex,
        contents: PixelBuffer,
        scale: f32,
        cache: &mut TextureCache,
        allocator: &mut dyn BufferAllocator,
    ) {
        let expected_rect = tile_rect(index, self.required_texture_size);
        if expected_rect.is_empty() {
            // Tile origin fell outside the texture after a resize; the job
            // is stale and silently dropped.
            return;
        }
        if contents.size != expected_rect.size {
            return;
        }
        self.install_tile(index, contents, scale, cache, allocator);
    }

    /// Allocate (or reuse) the tile's texture and upload `contents` into
    /// it. The caller has already validated the buffer size.
    fn install_tile(
        &mut self,
        index: TileIndex,
        contents: PixelBuffer,
        scale: f32,
        cache: &mut TextureCache,
        allocator: &mut dyn BufferAllocator,
    ) {
        let tile = self.tiles.entry(index).or_insert(Tile {
            texture: None,
            dirty: false,
            content_scale: scale,
        });
        let texture = match tile.texture {
            Some(texture) => texture,
            None => {
                let texture = cache.create_texture();
                tile.texture = Some(texture);
                texture
            }
        };
        if !cache.install(
            texture,
            contents.size,
            BackingPolicy::BackedWhenNecessary,
            allocator,
        ) {
            // Allocation failed; keep the tile dirty so the content is
            // repainted once memory frees up.
            tile.dirty = true;
            return;
        }
        cache.protect(texture);
        allocator.upload(
            cache
                .buffer_of(texture)
                .expect("installed texture has a buffer"),
            &contents.bytes,
            contents.size,
            IntPoint::default(),
        );
        cache
            .unprotect(texture)
            .expect("protect/unprotect must balance across upload");
        tile.dirty = false;
        tile.content_scale = scale;
    }

    /// Enumerate drawable tiles for the inflated visible rect (texture
    /// space) at `scale`, publishing a needs-render snapshot for whatever
    /// could not be drawn. A tile at the wrong content scale may be drawn
    /// as a placeholder only when it is the sole tile: overlapping
    /// mismatched tiles would show seams.
    pub fn visible_tiles(
        &mut self,
        visible_rect: IntRect,
        scale: f32,
        cache: &mut TextureCache,
    ) -> Vec<TileDraw> {
        let mut draws = Vec::new();
        let mut needs_render = Vec::new();
        // In single-texture mode there is exactly one drawable entry and
        // it always covers the full content, so visibility does not prune.
        let indices = if self.single_texture {
            if self.required_texture_size.is_empty() {
                Vec::new()
            } else {
                vec![TileIndex::new(0, 0)]
            }
        } else {
            indices_intersecting(visible_rect, self.required_texture_size)
        };

        for index in indices {
            let rect = if self.single_texture {
                IntRect::from_size(self.required_texture_size)
            } else {
                tile_rect(index, self.required_texture_size)
            };
            let Some(tile) = self.tiles.get(&index) else {
                needs_render.push(index);
                continue;
            };
            let Some(texture) = tile.texture else {
                needs_render.push(index);
                continue;
            };
            if !cache.has_buffer(texture) {
                // Evicted since last frame.
                needs_render.push(index);
                continue;
            }
            if tile.dirty {
                needs_render.push(index);
                continue;
            }
            if tile.content_scale != scale {
                needs_render.push(index);
                if self.tiles.len() == 1 {
                    cache.texture_accessed(texture);
                    draws.push(TileDraw {
                        index,
                        texture,
                        rect,
                    });
                }
                continue;
            }
            cache.texture_accessed(texture);
            draws.push(TileDraw {
                index,
                texture,
                rect,
            });
        }

        self.last_needs_render = needs_render.len();
        self.visibility.publish(VisibilitySnapshot {
            visible_rect,
            needs_render,
        });
        draws
    }

    /// How many tiles the last draw pass could not serve. Nonzero means
    /// another frame should be scheduled once the producer catches up.
    pub fn last_needs_render_count(&self) -> usize {
        self.last_needs_render
    }

    /// Release every tile texture back to the cache. Must run before the
    /// consumer half is dropped so GPU buffers are reclaimed explicitly.
    pub fn release_textures(&mut self, cache: &mut TextureCache) {
        for (_, tile) in self.tiles.drain() {
            if let Some(texture) = tile.texture {
                cache.release(texture);
            }
        }
    }
}

fn extract_subrect(buffer: &PixelBuffer, rect: IntRect) -> PixelBuffer {
    assert!(
        rect.min_x() >= 0
            && rect.min_y() >= 0
            && rect.max_x() <= buffer.size.width as i32
            && rect.max_y() <= buffer.size.height as i32,
        "subrect outside source buffer"
    );
    let mut bytes = Vec::with_capacity(rect.size.area_bytes_rgba8());
    let source_stride = buffer.size.width as usize * 4;
    for row in 0..rect.size.height as usize {
        let source_y = rect.min_y() as usize + row;
        let start = source_y * source_stride + rect.min_x() as usize * 4;
        let end = start + rect.size.width as usize * 4;
        bytes.extend_from_slice(&buffer.bytes[start..end]);
    }
    PixelBuffer::new(rect.size, bytes)
}

#[cfg(test)]
mod tests;
