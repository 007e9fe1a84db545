//! Frame phase 2: transform, opacity, clip, and surface resolution.

use geometry::{IntSize, Matrix4, Point, Rect, Vec4, project_rect};
use layer_tree::LayerId;
use texture_cache::TextureCache;

use crate::committed::CommittedLayer;
use crate::surface::RendererSurface;
use crate::{Renderer, Viewport};

impl Renderer {
    /// Depth-first transform pass. Recomputes every derived field from
    /// committed (plus animated/override) state; nothing from the
    /// previous frame survives.
    pub fn update_layers(&mut self, root: &mut CommittedLayer) {
        self.surface_order.clear();
        let viewport = self.viewport;
        // Document to device: shift the visible origin out, then scale.
        let base = Matrix4::scaling(viewport.scale, viewport.scale, 1.0).multiply(
            &Matrix4::translation(
                -viewport.visible_rect.min_x(),
                -viewport.visible_rect.min_y(),
                0.0,
            ),
        );
        let mut context = UpdateContext {
            viewport,
            surface_order: &mut self.surface_order,
            cache: &mut self.cache,
        };
        update_layer(
            root,
            base,
            1.0,
            viewport.clip_rect,
            viewport.scale,
            false,
            &mut context,
        );
    }
}

struct UpdateContext<'a> {
    viewport: Viewport,
    surface_order: &'a mut Vec<LayerId>,
    cache: &'a mut TextureCache,
}

/// `content_scale` is the document-to-pixel scale content rasterizes at:
/// the viewport scale at the top, carried unchanged into surfaces so
/// offscreen passes keep device resolution. `inside_fixed_container` is
/// true once an ancestor declared itself the containing block for fixed
/// descendants; those descendants scroll with the container instead of
/// pinning to the viewport.
fn update_layer(
    layer: &mut CommittedLayer,
    parent: Matrix4,
    parent_opacity: f32,
    clip: Rect,
    content_scale: f32,
    inside_fixed_container: bool,
    context: &mut UpdateContext<'_>,
) {
    let bounds = layer.effective_bounds();
    let mut position = layer.effective_position();
    if layer.fixed.is_fixed && !layer.fixed.has_fixed_ancestor && !inside_fixed_container {
        let adjustment = fixed_position_adjustment(&context.viewport, layer);
        position = Point::new(position.x + adjustment.x, position.y + adjustment.y);
    }
    let anchor = layer.effective_anchor_point();
    // CSS transform-origin: the transform pivots about the anchor, and
    // `position` locates the anchor in parent space. The quad itself is
    // modeled centered on the origin, so the post-transform correction
    // moves the center to where the anchor math expects it.
    let anchor_correction = Point::new(
        (0.5 - anchor.x) * bounds.width,
        (0.5 - anchor.y) * bounds.height,
    );
    // Order is load-bearing: parent × translate(position) × transform ×
    // translate(anchor correction).
    let screen_transform = parent
        .multiply(&Matrix4::translation(position.x, position.y, 0.0))
        .multiply(&layer.effective_transform())
        .multiply(&Matrix4::translation(
            anchor_correction.x,
            anchor_correction.y,
            0.0,
        ));

    layer.draw_opacity = parent_opacity * layer.effective_opacity();
    let quad = Rect::new(
        -bounds.width / 2.0,
        -bounds.height / 2.0,
        bounds.width,
        bounds.height,
    );
    let projected = project_rect(&screen_transform, quad);
    layer.bounding_box = polygon_bounds(&projected);
    layer.center_w = screen_transform
        .map_vec4(Vec4::new(0.0, 0.0, 0.0, 1.0))
        .w;
    layer.clip_rect = clip;
    layer.visible = !layer.bounding_box.intersection(clip).is_empty() && layer.draw_opacity > 0.0;
    layer.needs_stencil = layer.masks_to_bounds && screen_transform.has_out_of_plane_rotation();

    let needs_surface = layer.needs_surface();
    // Content inside a surface draws at full opacity; the accumulated
    // opacity is applied exactly once when the surface composites into
    // its target.
    layer.content_opacity = if needs_surface { 1.0 } else { layer.draw_opacity };
    let (content_transform, child_clip, child_scale) = if needs_surface {
        // The subtree renders into an offscreen surface; the screen
        // transform moves onto the surface and the layer's own draw
        // transform is redirected to the surface's local origin.
        let surface_width = (bounds.width * content_scale).ceil();
        let surface_height = (bounds.height * content_scale).ceil();
        let mut surface = match layer.surface.take() {
            Some(surface) => surface,
            None => RendererSurface::new(context.cache),
        };
        surface.draw_transform = screen_transform;
        surface.replica_transform = layer
            .replica
            .as_ref()
            .map(|replica| replica_transform(replica, parent));
        surface.requested_size = IntSize::new(
            surface_width.max(0.0) as u32,
            surface_height.max(0.0) as u32,
        );
        layer.surface = Some(surface);
        context.surface_order.push(layer.id);

        let local = Matrix4::translation(surface_width / 2.0, surface_height / 2.0, 0.0)
            .multiply(&Matrix4::scaling(content_scale, content_scale, 1.0));
        let surface_rect = Rect::new(0.0, 0.0, surface_width, surface_height);
        (local, surface_rect, content_scale)
    } else {
        if let Some(mut surface) = layer.surface.take() {
            surface.release(context.cache);
        }
        let child_clip = if layer.masks_to_bounds {
            clip.intersection(layer.bounding_box)
        } else {
            clip
        };
        (screen_transform, child_clip, content_scale)
    };

    // Bounding box and center_w stay in screen space even for surface
    // layers; the surface composites into the scene with them.
    layer.draw_transform = content_transform;

    // Children live in the layer's top-left coordinate space.
    let mut child_base = content_transform
        .multiply(&layer.sublayer_transform)
        .multiply(&Matrix4::translation(
            -bounds.width / 2.0,
            -bounds.height / 2.0,
            0.0,
        ));
    if !layer.preserves_3d {
        child_base = child_base.flattened_to_2d();
    }

    let opacity_for_children = if needs_surface { 1.0 } else { layer.draw_opacity };
    let child_in_fixed_container = inside_fixed_container || layer.fixed.is_container_for_fixed;
    for child in &mut layer.children {
        update_layer(
            child,
            child_base,
            opacity_for_children,
            child_clip,
            child_scale,
            child_in_fixed_container,
            context,
        );
    }
}

/// Pin a fixed-position layer to its viewport edge by translating it with
/// the divergence between the visible and layout rectangles.
fn fixed_position_adjustment(viewport: &Viewport, layer: &CommittedLayer) -> Point {
    let visible = viewport.visible_rect;
    let layout = viewport.layout_rect;
    let dx = if layer.fixed.pinned_to_left {
        visible.min_x() - layout.min_x()
    } else {
        visible.max_x() - layout.max_x()
    };
    let dy = if layer.fixed.pinned_to_top {
        visible.min_y() - layout.min_y()
    } else {
        visible.max_y() - layout.max_y()
    };
    Point::new(dx, dy)
}

fn replica_transform(replica: &CommittedLayer, parent: Matrix4) -> Matrix4 {
    let bounds = replica.effective_bounds();
    let anchor = replica.effective_anchor_point();
    let position = replica.effective_position();
    let anchor_correction = Point::new(
        (0.5 - anchor.x) * bounds.width,
        (0.5 - anchor.y) * bounds.height,
    );
    parent
        .multiply(&Matrix4::translation(position.x, position.y, 0.0))
        .multiply(&replica.effective_transform())
        .multiply(&Matrix4::translation(
            anchor_correction.x,
            anchor_correction.y,
            0.0,
        ))
}

fn polygon_bounds(points: &[Point]) -> Rect {
    let mut iter = points.iter();
    let Some(first) = iter.next() else {
        return Rect::default();
    };
    let mut min_x = first.x;
    let mut min_y = first.y;
    let mut max_x = first.x;
    let mut max_y = first.y;
    for point in iter {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
}
