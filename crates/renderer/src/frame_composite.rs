//! Frame phase 3: surface rendering and the main composite pass.

use filters::plan_filter_actions;
use geometry::{IntRect, Matrix4, Point, Rect, project_rect, unproject_point};
use layer_tree::LayerId;
use texture_cache::{BufferAllocator, TextureCache, TextureKey};
use tiler::{VIEWPORT_INFLATION_X, VIEWPORT_INFLATION_Y};

use crate::committed::{CommittedContent, CommittedLayer};
use crate::plan::{DrawOp, FramePlan};
use crate::Renderer;

impl Renderer {
    /// Composite the frame. Offscreen surfaces render first, in reverse
    /// collection order so a surface that samples another (a filtered
    /// layer inside a masked one) finds it already rendered. The main
    /// pass then draws the scene into the target.
    pub fn composite_layers(
        &mut self,
        root: &mut CommittedLayer,
        allocator: &mut dyn BufferAllocator,
    ) -> FramePlan {
        let mut plan = FramePlan::default();
        let scale = self.viewport.scale;

        let order = std::mem::take(&mut self.surface_order);
        for id in order.iter().rev() {
            if let Some(layer) = root.find_mut(*id) {
                render_surface(layer, &mut self.cache, allocator, &mut plan, scale);
            }
        }
        self.surface_order = order;

        let mut context = CompositeContext {
            cache: &mut self.cache,
            allocator,
            scale,
            stencil_depth: 0,
            scissor_stack: Vec::new(),
            debug_borders: self.debug_borders,
        };
        draw_layer(root, &mut plan, &mut context, DrawMode::Normal);

        accumulate_frame_feedback(root, &mut plan);
        plan
    }
}

struct CompositeContext<'a> {
    cache: &'a mut TextureCache,
    allocator: &'a mut dyn BufferAllocator,
    scale: f32,
    stencil_depth: u32,
    /// Scissor rects currently in force, innermost last. Closing a scope
    /// restores the enclosing rect, not the full target.
    scissor_stack: Vec<IntRect>,
    debug_borders: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DrawMode {
    /// Regular traversal: a layer owning a surface draws the surface.
    Normal,
    /// Rendering a surface owner's own subtree into its surface.
    SurfaceContent,
    /// Flattened preserve-3D group member: own content only; 3D children
    /// were collected as separate group entries.
    GroupMember,
}

fn render_surface(
    layer: &mut CommittedLayer,
    cache: &mut TextureCache,
    allocator: &mut dyn BufferAllocator,
    plan: &mut FramePlan,
    scale: f32,
) {
    let actions = plan_filter_actions(&layer.filters);
    let needs_scratch = !actions.is_empty();
    let requested = match &layer.surface {
        Some(surface) => surface.requested_size,
        None => return,
    };
    let ready = {
        let surface = layer.surface.as_mut().expect("surface checked above");
        surface.ensure_backing(requested, needs_scratch, cache, allocator)
    };
    if !ready {
        // Allocation failed; drop the surface for this frame so the main
        // pass draws nothing stale, and retry next frame.
        log::warn!("surface allocation failed for layer {:?}; skipping", layer.id);
        if let Some(mut surface) = layer.surface.take() {
            surface.release(cache);
        }
        return;
    }
    let (texture, scratch) = {
        let surface = layer.surface.as_ref().expect("surface checked above");
        (surface.texture(), surface.scratch())
    };

    plan.ops.push(DrawOp::BeginSurface {
        layer: layer.id,
        texture,
        scratch,
    });
    let mut context = CompositeContext {
        cache,
        allocator,
        scale,
        stencil_depth: 0,
        scissor_stack: Vec::new(),
        debug_borders: false,
    };
    draw_layer(layer, plan, &mut context, DrawMode::SurfaceContent);
    for action in actions {
        plan.ops.push(DrawOp::FilterPass {
            layer: layer.id,
            action,
        });
    }
    plan.ops.push(DrawOp::EndSurface { layer: layer.id });
}

fn draw_layer(
    layer: &mut CommittedLayer,
    plan: &mut FramePlan,
    context: &mut CompositeContext<'_>,
    mode: DrawMode,
) {
    if layer.surface.is_some() && mode != DrawMode::SurfaceContent {
        draw_surface_ops(layer, plan, context);
        return;
    }

    // Clip scope. A rotated masksToBounds clip cannot be expressed as a
    // scissor rect; raise a stencil region instead and nest by depth.
    let scope = if layer.masks_to_bounds && mode != DrawMode::SurfaceContent {
        if layer.needs_stencil {
            context.stencil_depth += 1;
            plan.ops.push(DrawOp::BeginStencilClip {
                quad: layer_screen_quad(layer),
                depth: context.stencil_depth,
            });
            ClipScope::Stencil
        } else {
            let scissor = layer
                .clip_rect
                .intersection(layer.bounding_box)
                .enclosing_int_rect();
            context.scissor_stack.push(scissor);
            plan.ops.push(DrawOp::SetScissor {
                rect: Some(scissor),
            });
            ClipScope::Scissor
        }
    } else {
        ClipScope::None
    };

    if layer.visible || mode == DrawMode::SurfaceContent {
        draw_own_content(layer, plan, context);
    }

    let draw_children = mode != DrawMode::GroupMember || !layer.preserves_3d;
    if draw_children {
        if layer.preserves_3d {
            draw_3d_group(layer, plan, context);
        } else {
            for child in &mut layer.children {
                draw_layer(child, plan, context, DrawMode::Normal);
            }
        }
    }

    match scope {
        ClipScope::Stencil => {
            plan.ops.push(DrawOp::EndStencilClip {
                depth: context.stencil_depth,
            });
            context.stencil_depth -= 1;
        }
        ClipScope::Scissor => {
            context.scissor_stack.pop();
            plan.ops.push(DrawOp::SetScissor {
                rect: context.scissor_stack.last().copied(),
            });
        }
        ClipScope::None => {}
    }
}

enum ClipScope {
    None,
    Scissor,
    Stencil,
}

/// A preserve-3D subtree forms one flat depth-sorted group spanning all
/// preserve-3D descendants, drawn back-to-front by projective w.
fn draw_3d_group(
    layer: &mut CommittedLayer,
    plan: &mut FramePlan,
    context: &mut CompositeContext<'_>,
) {
    let mut entries: Vec<(Vec<usize>, f32)> = Vec::new();
    collect_3d_paths(layer, &mut Vec::new(), &mut entries);
    // Larger w is farther from the eye; back-to-front means descending.
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (path, _) in entries {
        let member = layer_at_path_mut(layer, &path);
        draw_layer(member, plan, context, DrawMode::GroupMember);
    }
}

fn collect_3d_paths(
    layer: &CommittedLayer,
    base: &mut Vec<usize>,
    entries: &mut Vec<(Vec<usize>, f32)>,
) {
    for (index, child) in layer.children.iter().enumerate() {
        base.push(index);
        entries.push((base.clone(), child.center_w));
        if child.preserves_3d {
            collect_3d_paths(child, base, entries);
        }
        base.pop();
    }
}

fn layer_at_path_mut<'a>(
    mut layer: &'a mut CommittedLayer,
    path: &[usize],
) -> &'a mut CommittedLayer {
    for &index in path {
        layer = &mut layer.children[index];
    }
    layer
}

fn draw_surface_ops(
    layer: &mut CommittedLayer,
    plan: &mut FramePlan,
    context: &mut CompositeContext<'_>,
) {
    if !layer.visible {
        return;
    }
    let Some(surface) = &layer.surface else {
        return;
    };
    let texture = surface.texture();
    let size = surface.size();
    let rect = Rect::new(
        -(size.width as f32) / 2.0,
        -(size.height as f32) / 2.0,
        size.width as f32,
        size.height as f32,
    );
    // The surface is already in device pixels; its draw transform maps
    // layer units, so scale back down.
    let scale = context.scale;
    let to_scene = |transform: Matrix4| {
        transform.multiply(&Matrix4::scaling(1.0 / scale, 1.0 / scale, 1.0))
    };
    let mask = layer.mask.as_deref().and_then(single_content_texture);

    // Replica first so the reflection sits behind the original.
    if let Some(replica_transform) = surface.replica_transform {
        plan.ops.push(DrawOp::DrawSurface {
            layer: layer.id,
            texture,
            rect,
            transform: to_scene(replica_transform),
            opacity: layer.draw_opacity,
            mask,
        });
    }
    plan.ops.push(DrawOp::DrawSurface {
        layer: layer.id,
        texture,
        rect,
        transform: to_scene(surface.draw_transform),
        opacity: layer.draw_opacity,
        mask,
    });
    if context.debug_borders {
        plan.ops.push(DrawOp::DebugBorder {
            rect,
            transform: to_scene(surface.draw_transform),
            color: geometry::Color::rgba(255, 0, 255, 255),
        });
    }
}

fn draw_own_content(
    layer: &mut CommittedLayer,
    plan: &mut FramePlan,
    context: &mut CompositeContext<'_>,
) {
    let bounds = layer.effective_bounds();
    let quad = Rect::new(
        -bounds.width / 2.0,
        -bounds.height / 2.0,
        bounds.width,
        bounds.height,
    );
    let transform = layer.draw_transform;
    let opacity = layer.content_opacity;
    let id = layer.id;

    match &mut layer.content {
        CommittedContent::None => {}
        CommittedContent::HolePunch => {
            plan.hole_punch_rects.push(layer.bounding_box);
            plan.ops.push(DrawOp::HolePunch {
                rect: quad,
                transform,
            });
        }
        CommittedContent::SolidColor(color) => {
            if let Some(texture) = context.cache.texture_for_color(*color, context.allocator) {
                plan.ops.push(DrawOp::DrawColor {
                    layer: id,
                    texture,
                    rect: quad,
                    transform,
                    opacity,
                    color: *color,
                });
            }
        }
        CommittedContent::Image { texture, .. } => {
            if let Some(texture) = *texture {
                if context.cache.has_buffer(texture) {
                    context.cache.texture_accessed(texture);
                    plan.ops.push(DrawOp::DrawImage {
                        layer: id,
                        texture,
                        rect: quad,
                        transform,
                        opacity,
                    });
                }
            }
        }
        CommittedContent::Tiled {
            consumer: Some(consumer),
        } => {
            let visible = tiled_visible_rect(
                transform,
                bounds,
                layer.clip_rect,
                context.scale,
                consumer.required_texture_size(),
            );
            // Tile rects are texture pixels; map them back into the
            // layer's centered unit space before transforming.
            let tile_transform = transform
                .multiply(&Matrix4::translation(
                    -bounds.width / 2.0,
                    -bounds.height / 2.0,
                    0.0,
                ))
                .multiply(&Matrix4::scaling(
                    1.0 / context.scale,
                    1.0 / context.scale,
                    1.0,
                ));
            for draw in consumer.visible_tiles(visible, context.scale, context.cache) {
                plan.ops.push(DrawOp::DrawTile {
                    layer: id,
                    texture: draw.texture,
                    rect: draw.rect.to_rect(),
                    transform: tile_transform,
                    opacity,
                });
            }
        }
        CommittedContent::Tiled { consumer: None } => {}
    }

    if context.debug_borders && !matches!(layer.content, CommittedContent::None) {
        plan.ops.push(DrawOp::DebugBorder {
            rect: quad,
            transform,
            color: geometry::Color::rgba(0, 255, 0, 255),
        });
    }
}

/// Texture-space rect worth drawing/rendering for a tiled layer: the clip
/// rect unprojected into layer space, inflated ahead of likely scrolling.
fn tiled_visible_rect(
    transform: Matrix4,
    bounds: geometry::Size,
    clip: Rect,
    scale: f32,
    texture_size: geometry::IntSize,
) -> IntRect {
    let full = IntRect::from_size(texture_size);
    let corners = [
        Point::new(clip.min_x(), clip.min_y()),
        Point::new(clip.max_x(), clip.min_y()),
        Point::new(clip.max_x(), clip.max_y()),
        Point::new(clip.min_x(), clip.max_y()),
    ];
    let mut local = Vec::with_capacity(4);
    for corner in corners {
        match unproject_point(&transform, corner) {
            Some(point) => local.push(point),
            // Edge-on layer: fall back to everything.
            None => return full,
        }
    }
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    for point in local {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    // Centered layer units -> texture pixels.
    let visible = Rect::new(
        (min_x + bounds.width / 2.0) * scale,
        (min_y + bounds.height / 2.0) * scale,
        (max_x - min_x) * scale,
        (max_y - min_y) * scale,
    );
    visible
        .inflate_anisotropic(VIEWPORT_INFLATION_X, VIEWPORT_INFLATION_Y)
        .enclosing_int_rect()
        .intersection(full)
}

fn layer_screen_quad(layer: &CommittedLayer) -> Vec<Point> {
    let bounds = layer.effective_bounds();
    project_rect(
        &layer.draw_transform,
        Rect::new(
            -bounds.width / 2.0,
            -bounds.height / 2.0,
            bounds.width,
            bounds.height,
        ),
    )
}

/// Resolve the one texture a mask layer contributes. Tiled masks are
/// forced into single-texture mode at the producer, so a well-formed
/// mask always has exactly one.
fn single_content_texture(layer: &CommittedLayer) -> Option<TextureKey> {
    match &layer.content {
        CommittedContent::Tiled {
            consumer: Some(consumer),
        } if consumer.tile_count() == 1 => consumer.tile_texture(tiler::TileIndex::new(0, 0)),
        CommittedContent::Image { texture, .. } => *texture,
        _ => None,
    }
}

/// Fold per-layer frame feedback into the plan: dirty-region union over
/// layers whose pixels changed, and the needs-another-frame signal from
/// tiles the consumer could not serve.
fn accumulate_frame_feedback(layer: &CommittedLayer, plan: &mut FramePlan) {
    let animating = !layer.animations.is_empty() || !layer.override_patch.animations.is_empty();
    if layer.content_changed || animating {
        plan.dirty_rect = plan.dirty_rect.union(layer.bounding_box);
    }
    if let CommittedContent::Tiled {
        consumer: Some(consumer),
    } = &layer.content
    {
        if consumer.last_needs_render_count() > 0 {
            plan.needs_another_frame = true;
        }
    }
    if let Some(mask) = &layer.mask {
        accumulate_frame_feedback(mask, plan);
    }
    if let Some(replica) = &layer.replica {
        accumulate_frame_feedback(replica, plan);
    }
    for child in &layer.children {
        accumulate_frame_feedback(child, plan);
    }
}
