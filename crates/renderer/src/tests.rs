use std::collections::HashSet;
use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

use geometry::{Color, IntPoint, IntRect, IntSize, Matrix4, Point, Rect, Size};
use layer_tree::{AnimationValue, Keyframe, KeyframeAnimation, Layer};
use texture_cache::{BackingPolicy, BufferAllocator, GpuBufferId, TextureCache};
use tiler::{ContentPainter, PixelBuffer};

use crate::plan::DrawOp;
use crate::{CommittedLayer, FramePlan, Renderer, Viewport};

#[derive(Default)]
struct RecordingAllocator {
    next_id: u64,
    live: HashSet<GpuBufferId>,
    uploads: usize,
    fail_allocations: bool,
}

impl BufferAllocator for RecordingAllocator {
    fn allocate(&mut self, size: IntSize, _policy: BackingPolicy) -> Option<GpuBufferId> {
        if self.fail_allocations || size.is_empty() {
            return None;
        }
        self.next_id += 1;
        let id = GpuBufferId(self.next_id);
        self.live.insert(id);
        Some(id)
    }

    fn destroy(&mut self, buffer: GpuBufferId) {
        assert!(self.live.remove(&buffer), "destroyed a buffer twice");
    }

    fn upload(
        &mut self,
        buffer: GpuBufferId,
        _pixels: &[u8],
        _pixels_size: IntSize,
        _origin: IntPoint,
    ) {
        assert!(self.live.contains(&buffer), "upload to a dead buffer");
        self.uploads += 1;
    }
}

struct FillPainter;

impl ContentPainter for FillPainter {
    fn paint(&mut self, rect: IntRect, _scale: f32) -> Option<PixelBuffer> {
        Some(PixelBuffer::filled(rect.size, 0x7f))
    }
}

fn viewport(width: f32, height: f32) -> Viewport {
    Viewport {
        target_rect: Rect::new(0.0, 0.0, width, height),
        clip_rect: Rect::new(0.0, 0.0, width, height),
        visible_rect: Rect::new(0.0, 0.0, width, height),
        layout_rect: Rect::new(0.0, 0.0, width, height),
        contents_size: Size::new(width, height),
        scale: 1.0,
    }
}

fn test_renderer() -> (Renderer, RecordingAllocator) {
    let mut renderer = Renderer::new(TextureCache::new(64 * 1024 * 1024));
    renderer.set_viewport(viewport(200.0, 200.0));
    (renderer, RecordingAllocator::default())
}

fn run_frame(
    renderer: &mut Renderer,
    root: &mut CommittedLayer,
    now: f64,
    allocator: &mut RecordingAllocator,
) -> FramePlan {
    renderer.prepare_frame(root, now, allocator);
    renderer.update_layers(root);
    renderer.composite_layers(root, allocator)
}

fn solid_layer(color: Color, x: f32, y: f32, width: f32, height: f32) -> Layer {
    let mut layer = Layer::new();
    layer.set_bounds(Size::new(width, height));
    layer.position = Point::new(x, y);
    layer.set_solid_color(color);
    layer
}

fn container(x: f32, y: f32, width: f32, height: f32) -> Layer {
    let mut layer = Layer::new();
    layer.set_bounds(Size::new(width, height));
    layer.position = Point::new(x, y);
    layer
}

fn color_draws(plan: &FramePlan) -> Vec<Color> {
    plan.ops
        .iter()
        .filter_map(|op| match op {
            DrawOp::DrawColor { color, .. } => Some(*color),
            _ => None,
        })
        .collect()
}

const RED: Color = Color {
    red: 255,
    green: 0,
    blue: 0,
    alpha: 255,
};
const BLUE: Color = Color {
    red: 0,
    green: 0,
    blue: 255,
    alpha: 255,
};

#[test]
fn opacity_multiplies_down_the_tree() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    producer.opacity = 0.5;
    let mut child = container(100.0, 100.0, 100.0, 100.0);
    child.opacity = 0.8;
    let grandchild = solid_layer(RED, 50.0, 50.0, 50.0, 50.0);
    let grandchild_id = grandchild.id();
    child.add_child(grandchild);
    producer.add_child(child);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let leaf = root.find(grandchild_id).expect("grandchild is in the tree");
    assert!(
        (leaf.draw_opacity() - 0.4).abs() < 1e-6,
        "expected 0.5 * 0.8 * 1.0 = 0.4, got {}",
        leaf.draw_opacity()
    );
}

#[test]
fn transform_pivots_about_the_anchor_point() {
    let mut producer = container(50.0, 50.0, 100.0, 100.0);
    producer.transform = Matrix4::rotation_z(FRAC_PI_2);
    producer.set_solid_color(RED);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    // Rotating a centered quad 90 degrees about its (0.5, 0.5) anchor at
    // position (50, 50) sends the top-left corner to (100, 0).
    let corner = root.draw_transform().map_point(Point::new(-50.0, -50.0));
    assert!((corner.x - 100.0).abs() < 1e-3, "corner.x was {}", corner.x);
    assert!(corner.y.abs() < 1e-3, "corner.y was {}", corner.y);

    let bounds = root.bounding_box();
    assert!(bounds.min_x().abs() < 1e-3 && bounds.min_y().abs() < 1e-3);
    assert!((bounds.size.width - 100.0).abs() < 1e-3);
    assert!((bounds.size.height - 100.0).abs() < 1e-3);
}

#[test]
fn solid_color_layer_emits_one_color_draw() {
    let mut producer = solid_layer(RED, 100.0, 100.0, 200.0, 200.0);
    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    assert_eq!(color_draws(&plan), vec![RED]);
    assert!(allocator.uploads >= 1, "color texture pixel never uploaded");
}

#[test]
fn hole_punch_layers_report_their_rects() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let mut punch = container(50.0, 50.0, 100.0, 100.0);
    punch.set_hole_punch();
    producer.add_child(punch);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    assert!(plan.ops.iter().any(|op| matches!(op, DrawOp::HolePunch { .. })));
    assert_eq!(plan.hole_punch_rects.len(), 1);
    let rect = plan.hole_punch_rects[0];
    assert!(rect.min_x().abs() < 1e-3 && rect.min_y().abs() < 1e-3);
    assert!((rect.size.width - 100.0).abs() < 1e-3);
}

#[test]
fn layers_outside_the_clip_are_culled() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    producer.add_child(solid_layer(RED, 50.0, 50.0, 50.0, 50.0));
    producer.add_child(solid_layer(BLUE, 1000.0, 1000.0, 50.0, 50.0));

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    assert_eq!(color_draws(&plan), vec![RED]);
}

#[test]
fn axis_aligned_clip_scissors_and_rotated_clip_stencils() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let mut scissored = container(100.0, 100.0, 150.0, 150.0);
    scissored.masks_to_bounds = true;
    scissored.add_child(solid_layer(RED, 50.0, 50.0, 50.0, 50.0));

    let mut stenciled = container(75.0, 75.0, 100.0, 100.0);
    stenciled.masks_to_bounds = true;
    stenciled.transform = Matrix4::rotation_x(0.5);
    stenciled.add_child(solid_layer(BLUE, 50.0, 50.0, 50.0, 50.0));

    scissored.add_child(stenciled);
    producer.add_child(scissored);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    assert_eq!(plan.stencil_scope_count(), 1);
    assert!(plan
        .ops
        .iter()
        .any(|op| matches!(op, DrawOp::SetScissor { rect: Some(_) })));
    // The scissor scope must be restored after the subtree.
    assert!(plan
        .ops
        .iter()
        .any(|op| matches!(op, DrawOp::SetScissor { rect: None })));
    assert!(plan
        .ops
        .iter()
        .any(|op| matches!(op, DrawOp::EndStencilClip { depth: 1 })));
}

#[test]
fn masked_layer_composites_through_a_surface() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let mut masked = container(100.0, 100.0, 100.0, 100.0);
    masked.set_image_content(Arc::new(PixelBuffer::filled(IntSize::new(100, 100), 0xff)));
    let mut mask = container(50.0, 50.0, 100.0, 100.0);
    mask.set_image_content(Arc::new(PixelBuffer::filled(IntSize::new(100, 100), 0x80)));
    masked.set_mask(Some(mask));
    producer.add_child(masked);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let begin = plan
        .ops
        .iter()
        .position(|op| matches!(op, DrawOp::BeginSurface { .. }))
        .expect("masked layer renders through a surface");
    let end = plan
        .ops
        .iter()
        .position(|op| matches!(op, DrawOp::EndSurface { .. }))
        .expect("surface block is closed");
    let composite = plan
        .ops
        .iter()
        .position(|op| matches!(op, DrawOp::DrawSurface { .. }))
        .expect("surface is composited into the scene");
    assert!(begin < end && end < composite, "surface renders before use");

    let mask_attached = plan.ops.iter().any(|op| {
        matches!(op, DrawOp::DrawSurface { mask: Some(_), .. })
    });
    assert!(mask_attached, "mask texture missing from the surface draw");
}

#[test]
fn filter_passes_come_in_pairs_with_a_scratch() {
    let mut producer = container(100.0, 100.0, 100.0, 100.0);
    producer.set_solid_color(RED);
    producer.set_filters(vec![filters::FilterOperation::Blur(4.0)]);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let passes = plan
        .ops
        .iter()
        .filter(|op| matches!(op, DrawOp::FilterPass { .. }))
        .count();
    assert_eq!(passes, 2, "separable blur is two passes");
    assert!(plan.ops.iter().any(|op| {
        matches!(op, DrawOp::BeginSurface { scratch: Some(_), .. })
    }));
}

#[test]
fn preserve_3d_group_draws_back_to_front() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    producer.preserves_3d = true;
    producer.sublayer_transform = Matrix4::perspective(500.0);

    let mut far = solid_layer(RED, 100.0, 100.0, 100.0, 100.0);
    far.transform = Matrix4::translation(0.0, 0.0, -100.0);
    let mut near = solid_layer(BLUE, 100.0, 100.0, 100.0, 100.0);
    near.transform = Matrix4::translation(0.0, 0.0, 100.0);

    // Producer order puts the near layer first; depth sorting must win.
    producer.add_child(near);
    producer.add_child(far);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    assert_eq!(color_draws(&plan), vec![RED, BLUE]);
}

#[test]
fn image_allocation_failure_retries_next_frame() {
    let mut producer = container(100.0, 100.0, 100.0, 100.0);
    producer.set_image_content(Arc::new(PixelBuffer::filled(IntSize::new(100, 100), 0xff)));

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();

    allocator.fail_allocations = true;
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);
    assert!(
        !plan.ops.iter().any(|op| matches!(op, DrawOp::DrawImage { .. })),
        "image drawn despite failed upload"
    );

    allocator.fail_allocations = false;
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);
    assert!(plan.ops.iter().any(|op| matches!(op, DrawOp::DrawImage { .. })));
}

#[test]
fn commit_reconciliation_keeps_consumer_side_state() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let child = solid_layer(RED, 50.0, 50.0, 50.0, 50.0);
    let child_id = child.id();
    producer.add_child(child);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, _allocator) = test_renderer();
    root.find_mut(child_id)
        .expect("child committed")
        .override_patch
        .opacity = Some(0.25);

    // Producer moves the child; the consumer-side override must survive.
    producer.children_mut()[0].position = Point::new(80.0, 80.0);
    root.apply_snapshot(producer.commit_snapshot(), renderer.cache_mut());

    let child = root.find(child_id).expect("child survived the commit");
    assert_eq!(child.override_patch.opacity, Some(0.25));
    assert!((child.position.x - 80.0).abs() < 1e-6);
}

#[test]
fn removed_subtree_textures_enter_the_garbage_list() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let mut child = container(50.0, 50.0, 100.0, 100.0);
    child.set_image_content(Arc::new(PixelBuffer::filled(IntSize::new(100, 100), 0xff)));
    let child_id = child.id();
    producer.add_child(child);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    producer.remove_child(child_id).expect("child is present");
    root.apply_snapshot(producer.commit_snapshot(), renderer.cache_mut());

    assert!(
        renderer.cache().garbage_len() > 0,
        "removed layer's texture should await deferred destruction"
    );
    renderer.cache_mut().collect_garbage(&mut allocator);
    assert_eq!(renderer.cache().garbage_len(), 0);
}

#[test]
fn running_animation_schedules_another_frame() {
    let mut producer = solid_layer(RED, 100.0, 100.0, 200.0, 200.0);
    producer.add_animation(KeyframeAnimation::new(
        "fade-in",
        vec![
            Keyframe {
                offset: 0.0,
                value: AnimationValue::Opacity(0.0),
            },
            Keyframe {
                offset: 1.0,
                value: AnimationValue::Opacity(1.0),
            },
        ],
        2.0,
        Some(1),
    ));

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();

    let needs_frame = renderer.prepare_frame(&mut root, 0.5, &mut allocator);
    assert!(needs_frame, "unfinished animation must request a frame");
    renderer.update_layers(&mut root);
    assert!(
        (root.draw_opacity() - 0.25).abs() < 1e-6,
        "opacity at t=0.5 of a 2s fade should be 0.25, got {}",
        root.draw_opacity()
    );

    let needs_frame = renderer.prepare_frame(&mut root, 5.0, &mut allocator);
    assert!(!needs_frame, "finished animation keeps scheduling frames");
}

#[test]
fn suspended_animation_replays_without_scheduling() {
    let mut producer = solid_layer(RED, 100.0, 100.0, 200.0, 200.0);
    producer.add_animation(KeyframeAnimation::new(
        "fade-in",
        vec![
            Keyframe {
                offset: 0.0,
                value: AnimationValue::Opacity(0.0),
            },
            Keyframe {
                offset: 1.0,
                value: AnimationValue::Opacity(1.0),
            },
        ],
        2.0,
        None,
    ));
    producer.suspend_animations(1.0);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();

    // Long after suspension the frozen offset still applies.
    let needs_frame = renderer.prepare_frame(&mut root, 60.0, &mut allocator);
    assert!(!needs_frame, "suspended animations never demand frames");
    renderer.update_layers(&mut root);
    assert!(
        (root.draw_opacity() - 0.5).abs() < 1e-6,
        "suspended at t=1.0 of a 2s fade should hold 0.5, got {}",
        root.draw_opacity()
    );
}

#[test]
fn tiled_layer_draws_its_visible_tiles() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    producer.set_tiled_content(Box::new(FillPainter));
    producer.update_contents(1.0);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let tiles = plan
        .ops
        .iter()
        .filter(|op| matches!(op, DrawOp::DrawTile { .. }))
        .count();
    assert_eq!(tiles, 1, "a 200x200 layer is a single tile");
    assert!(!plan.needs_another_frame);
}

#[test]
fn surface_content_draws_opaque_and_composites_with_accumulated_opacity() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    producer.opacity = 0.8;
    let mut filtered = solid_layer(RED, 100.0, 100.0, 100.0, 100.0);
    filtered.opacity = 0.5;
    filtered.set_filters(vec![filters::FilterOperation::Grayscale(1.0)]);
    producer.add_child(filtered);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let begin = plan
        .ops
        .iter()
        .position(|op| matches!(op, DrawOp::BeginSurface { .. }))
        .expect("filtered layer renders through a surface");
    let end = plan
        .ops
        .iter()
        .position(|op| matches!(op, DrawOp::EndSurface { .. }))
        .expect("surface block is closed");
    let content_opacity = plan.ops[begin..end]
        .iter()
        .find_map(|op| match op {
            DrawOp::DrawColor { opacity, .. } => Some(*opacity),
            _ => None,
        })
        .expect("surface content drawn inside the block");
    assert!(
        (content_opacity - 1.0).abs() < 1e-6,
        "content inside a surface must draw opaque, got {content_opacity}"
    );

    let composite_opacity = plan
        .ops
        .iter()
        .find_map(|op| match op {
            DrawOp::DrawSurface { opacity, .. } => Some(*opacity),
            _ => None,
        })
        .expect("surface is composited into the scene");
    assert!(
        (composite_opacity - 0.4).abs() < 1e-6,
        "composite applies 0.8 * 0.5 exactly once, got {composite_opacity}"
    );
}

#[test]
fn surfaces_render_at_the_viewport_scale() {
    let mut producer = solid_layer(RED, 50.0, 50.0, 100.0, 100.0);
    producer.set_filters(vec![filters::FilterOperation::Grayscale(1.0)]);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let mut scaled = viewport(200.0, 200.0);
    scaled.scale = 2.0;
    renderer.set_viewport(scaled);
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let texture = plan
        .ops
        .iter()
        .find_map(|op| match op {
            DrawOp::BeginSurface { texture, .. } => Some(*texture),
            _ => None,
        })
        .expect("filtered layer renders through a surface");
    assert_eq!(
        renderer.cache().size_of(texture),
        Some(IntSize::new(200, 200)),
        "a 100x100 layer at scale 2 needs a 200x200 surface"
    );
}

#[test]
fn closing_a_nested_scissor_restores_the_enclosing_rect() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    producer.masks_to_bounds = true;
    let mut inner = container(100.0, 100.0, 100.0, 100.0);
    inner.masks_to_bounds = true;
    inner.add_child(solid_layer(RED, 50.0, 50.0, 50.0, 50.0));
    producer.add_child(inner);
    // Drawn after the nested scope closes; must still be clipped by the
    // outer rect, not the full target.
    producer.add_child(solid_layer(BLUE, 100.0, 100.0, 50.0, 50.0));

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let scissors: Vec<Option<IntRect>> = plan
        .ops
        .iter()
        .filter_map(|op| match op {
            DrawOp::SetScissor { rect } => Some(*rect),
            _ => None,
        })
        .collect();
    assert_eq!(scissors.len(), 4, "two scopes open and close");
    assert!(scissors[0].is_some() && scissors[1].is_some());
    assert_eq!(
        scissors[2], scissors[0],
        "closing the inner scope restores the outer rect"
    );
    assert_eq!(scissors[3], None, "closing the outer scope lifts the clip");
}

#[test]
fn oversized_tiled_mask_still_attaches_to_the_surface_draw() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let mut masked = container(100.0, 100.0, 100.0, 100.0);
    masked.set_image_content(Arc::new(PixelBuffer::filled(IntSize::new(100, 100), 0xff)));
    // Larger than one tile; without single-texture storage this mask
    // would split into a grid and silently stop masking.
    let mut mask = container(50.0, 50.0, 600.0, 600.0);
    mask.set_tiled_content(Box::new(FillPainter));
    masked.set_mask(Some(mask));
    producer.add_child(masked);
    producer.update_contents(1.0);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    let mask_attached = plan.ops.iter().any(|op| {
        matches!(op, DrawOp::DrawSurface { mask: Some(_), .. })
    });
    assert!(mask_attached, "multi-tile mask missing from the surface draw");
}

fn scrolled_viewport() -> Viewport {
    let mut scrolled = viewport(200.0, 200.0);
    scrolled.visible_rect = Rect::new(0.0, 100.0, 200.0, 200.0);
    scrolled
}

#[test]
fn fixed_layer_pins_to_the_scrolled_viewport() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let mut pinned = solid_layer(RED, 50.0, 50.0, 50.0, 50.0);
    pinned.fixed.is_fixed = true;
    pinned.fixed.pinned_to_top = true;
    pinned.fixed.pinned_to_left = true;
    let pinned_id = pinned.id();
    producer.add_child(pinned);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    renderer.set_viewport(scrolled_viewport());
    run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    // Scrolled down 100px: the adjustment cancels the scroll and the
    // layer stays at y = 25 on screen.
    let bounds = root
        .find(pinned_id)
        .expect("pinned layer committed")
        .bounding_box();
    assert!((bounds.min_y() - 25.0).abs() < 1e-3, "min_y was {}", bounds.min_y());
    assert!((bounds.min_x() - 25.0).abs() < 1e-3, "min_x was {}", bounds.min_x());
}

#[test]
fn fixed_container_scopes_the_descendant_adjustment() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    producer.fixed.is_container_for_fixed = true;
    let mut pinned = solid_layer(RED, 50.0, 50.0, 50.0, 50.0);
    pinned.fixed.is_fixed = true;
    pinned.fixed.pinned_to_top = true;
    pinned.fixed.pinned_to_left = true;
    let pinned_id = pinned.id();
    producer.add_child(pinned);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    renderer.set_viewport(scrolled_viewport());
    run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    // Inside a fixed container the layer scrolls with its ancestor.
    let bounds = root
        .find(pinned_id)
        .expect("pinned layer committed")
        .bounding_box();
    assert!((bounds.min_y() + 75.0).abs() < 1e-3, "min_y was {}", bounds.min_y());
}

#[test]
fn fixed_layer_under_a_fixed_ancestor_is_not_adjusted_twice() {
    let mut producer = container(100.0, 100.0, 200.0, 200.0);
    let mut child = solid_layer(RED, 50.0, 50.0, 50.0, 50.0);
    child.fixed.is_fixed = true;
    child.fixed.has_fixed_ancestor = true;
    child.fixed.pinned_to_top = true;
    child.fixed.pinned_to_left = true;
    let child_id = child.id();
    producer.add_child(child);

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();
    renderer.set_viewport(scrolled_viewport());
    run_frame(&mut renderer, &mut root, 0.0, &mut allocator);

    // The ancestor already compensates for the scroll; the child rides
    // along without its own adjustment.
    let bounds = root
        .find(child_id)
        .expect("child committed")
        .bounding_box();
    assert!((bounds.min_y() + 75.0).abs() < 1e-3, "min_y was {}", bounds.min_y());
}

#[test]
fn first_upload_dirties_then_settles() {
    let mut producer = container(100.0, 100.0, 100.0, 100.0);
    producer.set_image_content(Arc::new(PixelBuffer::filled(IntSize::new(100, 100), 0xff)));

    let mut root = CommittedLayer::from_snapshot(producer.commit_snapshot());
    let (mut renderer, mut allocator) = test_renderer();

    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);
    assert!(
        !plan.dirty_rect.is_empty(),
        "first upload must dirty the layer's region"
    );

    let plan = run_frame(&mut renderer, &mut root, 0.0, &mut allocator);
    assert!(
        plan.dirty_rect.is_empty(),
        "steady frame with no changes must report nothing dirty"
    );
}
