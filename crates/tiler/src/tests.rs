use std::collections::HashSet;

use geometry::{IntPoint, IntRect, IntSize};
use texture_cache::{BackingPolicy, BufferAllocator, GpuBufferId, TextureCache};

use super::*;

struct RecordingAllocator {
    next_id: u64,
    live: HashSet<GpuBufferId>,
    uploads: Vec<(GpuBufferId, IntSize)>,
    fail_allocations: bool,
}

impl RecordingAllocator {
    fn new() -> Self {
        Self {
            next_id: 1,
            live: HashSet::new(),
            uploads: Vec::new(),
            fail_allocations: false,
        }
    }
}

impl BufferAllocator for RecordingAllocator {
    fn allocate(&mut self, _size: IntSize, _policy: BackingPolicy) -> Option<GpuBufferId> {
        if self.fail_allocations {
            return None;
        }
        let id = GpuBufferId(self.next_id);
        self.next_id += 1;
        self.live.insert(id);
        Some(id)
    }

    fn destroy(&mut self, buffer: GpuBufferId) {
        assert!(self.live.remove(&buffer), "destroyed a buffer twice");
    }

    fn upload(&mut self, buffer: GpuBufferId, pixels: &[u8], pixels_size: IntSize, _origin: IntPoint) {
        assert!(self.live.contains(&buffer), "upload to a dead buffer");
        assert_eq!(pixels.len(), pixels_size.area_bytes_rgba8());
        self.uploads.push((buffer, pixels_size));
    }
}

struct SolidPainter {
    value: u8,
    fail: bool,
    paint_rects: Vec<IntRect>,
}

impl SolidPainter {
    fn new(value: u8) -> Self {
        Self {
            value,
            fail: false,
            paint_rects: Vec::new(),
        }
    }
}

impl ContentPainter for SolidPainter {
    fn paint(&mut self, rect: IntRect, _scale: f32) -> Option<PixelBuffer> {
        if self.fail {
            return None;
        }
        self.paint_rects.push(rect);
        Some(PixelBuffer::filled(rect.size, self.value))
    }
}

fn cache() -> TextureCache {
    TextureCache::new(64 * 1024 * 1024)
}

fn pump(
    producer: &mut TilerProducer,
    consumer: &mut TilerConsumer,
    painter: &mut SolidPainter,
    scale: f32,
    cache: &mut TextureCache,
    allocator: &mut RecordingAllocator,
) {
    producer.update_if_needed(painter, scale);
    producer.commit_pending_jobs();
    consumer.upload_if_needed(cache, allocator);
}

#[test]
fn initial_update_paints_the_full_grid() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(600, 300));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();

    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    // 600x300 at tile size 256 is a 3x2 grid.
    assert_eq!(consumer.required_texture_size(), IntSize::new(600, 300));
    assert_eq!(consumer.tile_count(), 6);
    assert_eq!(allocator.uploads.len(), 6);
    assert!(!producer.has_pending_work());
}

#[test]
fn partial_dirty_repaints_only_intersecting_tiles() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(600, 300));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    let before: Vec<_> = (0..3)
        .flat_map(|i| (0..2).map(move |j| TileIndex::new(i, j)))
        .map(|index| (index, consumer.tile_texture(index)))
        .collect();

    painter.paint_rects.clear();
    allocator.uploads.clear();
    producer.mark_dirty(IntRect::new(10, 10, 20, 20));
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    assert_eq!(painter.paint_rects, vec![IntRect::new(0, 0, 256, 256)]);
    assert_eq!(allocator.uploads.len(), 1);
    // Untouched tiles keep their textures.
    for (index, texture) in before {
        assert_eq!(consumer.tile_texture(index), texture);
    }
}

#[test]
fn tile_job_queued_before_a_shrink_is_dropped() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(600, 300));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    // Queue a tile update, then shrink before the consumer runs. The
    // stale tile job must not survive the resize.
    producer.mark_dirty(IntRect::new(570, 10, 20, 20));
    producer.update_if_needed(&mut painter, 1.0);
    producer.set_contents_size(IntSize::new(200, 200));
    producer.update_if_needed(&mut painter, 1.0);
    producer.commit_pending_jobs();
    consumer.upload_if_needed(&mut cache, &mut allocator);

    assert_eq!(consumer.required_texture_size(), IntSize::new(200, 200));
    assert_eq!(consumer.tile_count(), 1);
    assert!(consumer.tile_texture(TileIndex::new(2, 0)).is_none());
}

#[test]
fn later_pixel_job_supersedes_an_earlier_one() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(100, 100));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    allocator.uploads.clear();
    producer.mark_dirty(IntRect::new(0, 0, 10, 10));
    producer.update_if_needed(&mut painter, 1.0);
    producer.mark_dirty(IntRect::new(0, 0, 10, 10));
    producer.update_if_needed(&mut painter, 1.0);
    producer.commit_pending_jobs();
    consumer.upload_if_needed(&mut cache, &mut allocator);

    // Two queued updates for the same tile collapse into one upload.
    assert_eq!(allocator.uploads.len(), 1);
}

#[test]
fn offscreen_dirty_tile_flows_back_through_the_snapshot() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(600, 300));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    // Only the left column is visible.
    let visible = IntRect::new(0, 0, 200, 300);
    let draws = consumer.visible_tiles(visible, 1.0, &mut cache);
    assert_eq!(draws.len(), 2);

    // Dirty a tile in the rightmost column. The producer learns the
    // visible rect from the snapshot and skips the offscreen paint.
    painter.paint_rects.clear();
    producer.mark_dirty(IntRect::new(560, 10, 20, 20));
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert!(painter.paint_rects.is_empty());
    assert!(consumer.tile_is_dirty(TileIndex::new(2, 0)));

    // Scroll the tile into view: the consumer refuses to draw the stale
    // texture and reports it for render.
    let wide = IntRect::new(0, 0, 600, 300);
    let draws = consumer.visible_tiles(wide, 1.0, &mut cache);
    assert!(!draws.iter().any(|draw| draw.index == TileIndex::new(2, 0)));

    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert_eq!(painter.paint_rects, vec![IntRect::new(512, 0, 88, 256)]);
    assert!(!consumer.tile_is_dirty(TileIndex::new(2, 0)));
    let draws = consumer.visible_tiles(wide, 1.0, &mut cache);
    assert_eq!(draws.len(), 6);
}

#[test]
fn full_contents_layers_skip_visibility_culling() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(600, 300));
    producer.set_render_full_contents(true);
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    let visible = IntRect::new(0, 0, 200, 300);
    consumer.visible_tiles(visible, 1.0, &mut cache);

    painter.paint_rects.clear();
    producer.mark_dirty(IntRect::new(560, 10, 20, 20));
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert_eq!(painter.paint_rects, vec![IntRect::new(512, 0, 88, 256)]);
}

#[test]
fn scale_change_resizes_and_repaints_everything() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(200, 100));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert_eq!(consumer.required_texture_size(), IntSize::new(200, 100));

    pump(&mut producer, &mut consumer, &mut painter, 2.0, &mut cache, &mut allocator);
    assert_eq!(consumer.required_texture_size(), IntSize::new(400, 200));
    assert_eq!(consumer.tile_count(), 2);
}

#[test]
fn required_size_is_clamped_to_the_maximum_dimension() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(10_000, 300));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert_eq!(
        consumer.required_texture_size(),
        IntSize::new(MAX_TEXTURE_DIMENSION, 300)
    );
}

#[test]
fn sole_tile_at_the_wrong_scale_is_drawn_as_a_placeholder() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(100, 100));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    // Ask to draw at a different scale before the repaint lands. The
    // single stale tile is still drawn so the layer does not flash, but
    // it is also reported as needing render.
    let draws = consumer.visible_tiles(IntRect::new(0, 0, 100, 100), 2.0, &mut cache);
    assert_eq!(draws.len(), 1);

    producer.update_if_needed(&mut painter, 2.0);
    assert!(producer.pending_job_count() > 0);
}

#[test]
fn single_tile_only_keeps_multi_tile_content_in_one_texture() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(600, 600));
    producer.set_render_full_contents(true);
    producer.set_single_tile_only(true);
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    // 600x600 would normally split into a 3x3 grid; the single-tile
    // request keeps it whole so it can be sampled as one texture.
    assert_eq!(consumer.required_texture_size(), IntSize::new(600, 600));
    assert_eq!(consumer.tile_count(), 1);
    assert_eq!(allocator.uploads, vec![(allocator.uploads[0].0, IntSize::new(600, 600))]);
    assert!(consumer.tile_texture(TileIndex::new(0, 0)).is_some());

    let draws = consumer.visible_tiles(IntRect::new(0, 0, 600, 600), 1.0, &mut cache);
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].rect, IntRect::new(0, 0, 600, 600));
}

#[test]
fn paint_failure_keeps_the_dirty_state_for_retry() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(100, 100));
    let mut painter = SolidPainter::new(0x10);
    painter.fail = true;
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert!(producer.has_pending_work());
    assert_eq!(consumer.tile_count(), 0);

    painter.fail = false;
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert!(!producer.has_pending_work());
    assert_eq!(consumer.tile_count(), 1);
}

#[test]
fn allocation_failure_leaves_the_tile_dirty() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(100, 100));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    allocator.fail_allocations = true;
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);

    assert!(consumer.tile_is_dirty(TileIndex::new(0, 0)));
    let draws = consumer.visible_tiles(IntRect::new(0, 0, 100, 100), 1.0, &mut cache);
    assert!(draws.is_empty());
}

#[test]
fn discard_releases_all_tile_textures() {
    let (mut producer, mut consumer) = tiler_pair(IntSize::new(600, 300));
    let mut painter = SolidPainter::new(0x10);
    let mut cache = cache();
    let mut allocator = RecordingAllocator::new();
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert!(cache.used_bytes() > 0);

    producer.set_contents_size(IntSize::default());
    pump(&mut producer, &mut consumer, &mut painter, 1.0, &mut cache, &mut allocator);
    assert_eq!(consumer.tile_count(), 0);
    assert_eq!(cache.used_bytes(), 0);
    cache.collect_garbage(&mut allocator);
    assert!(allocator.live.is_empty());
}

#[test]
fn subrect_extraction_copies_rows_with_the_source_stride() {
    let mut bytes = vec![0u8; IntSize::new(4, 4).area_bytes_rgba8()];
    // Tag each pixel with its x coordinate in the red channel.
    for y in 0..4 {
        for x in 0..4 {
            bytes[(y * 4 + x) * 4] = x as u8;
        }
    }
    let buffer = PixelBuffer::new(IntSize::new(4, 4), bytes);
    let sub = extract_subrect(&buffer, IntRect::new(2, 1, 2, 2));
    assert_eq!(sub.size, IntSize::new(2, 2));
    assert_eq!(sub.bytes[0], 2);
    assert_eq!(sub.bytes[4], 3);
}

#[test]
fn indices_intersecting_clamps_to_the_grid() {
    let size = IntSize::new(600, 300);
    let all = indices_intersecting(IntRect::new(-100, -100, 10_000, 10_000), size);
    assert_eq!(all.len(), 6);
    let none = indices_intersecting(IntRect::new(700, 0, 100, 100), size);
    assert!(none.is_empty());
}
