//! Clipping against the image plane and screen-point unprojection.
//!
//! Points mapped through a perspective transform can land behind the eye
//! (w at or below zero); projecting those produces garbage coordinates.
//! The compositor therefore clips the untransformed quad, in homogeneous
//! space, against the plane `w = epsilon` before any perspective divide.

use crate::{Matrix4, Point, Rect, Vec4};

/// Minimum w a vertex may keep after clipping.
pub const IMAGE_PLANE_EPSILON: f32 = 1e-4;

/// Newtype so call sites spell out which epsilon they clip with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipEpsilon(pub f32);

impl Default for ClipEpsilon {
    fn default() -> Self {
        Self(IMAGE_PLANE_EPSILON)
    }
}

fn interpolate_to_plane(inside: Vec4, outside: Vec4, epsilon: f32) -> Vec4 {
    // Solve for t where lerp(inside.w, outside.w, t) == epsilon.
    let denominator = inside.w - outside.w;
    debug_assert!(
        denominator.abs() > 0.0,
        "interpolation endpoints must straddle the plane"
    );
    let t = (inside.w - epsilon) / denominator;
    Vec4::new(
        inside.x + t * (outside.x - inside.x),
        inside.y + t * (outside.y - inside.y),
        inside.z + t * (outside.z - inside.z),
        epsilon,
    )
}

/// Sutherland–Hodgman clip of a convex polygon against `w > epsilon`.
///
/// Returns the clipped polygon; empty when every vertex is behind the
/// plane. Vertices on edges crossing the plane are replaced by their
/// plane intersection, so no output vertex has `w < epsilon`.
pub fn clip_polygon_to_image_plane(polygon: &[Vec4], epsilon: ClipEpsilon) -> Vec<Vec4> {
    let epsilon = epsilon.0;
    let mut clipped = Vec::with_capacity(polygon.len() + 2);
    if polygon.is_empty() {
        return clipped;
    }

    for (index, &current) in polygon.iter().enumerate() {
        let previous = polygon[(index + polygon.len() - 1) % polygon.len()];
        let current_inside = current.w >= epsilon;
        let previous_inside = previous.w >= epsilon;

        if current_inside {
            if !previous_inside {
                clipped.push(interpolate_to_plane(current, previous, epsilon));
            }
            clipped.push(current);
        } else if previous_inside {
            clipped.push(interpolate_to_plane(previous, current, epsilon));
        }
    }
    clipped
}

/// Map a layer-local rect through `transform`, clipping against the image
/// plane, and return the projected screen polygon. Empty when fully behind
/// the eye.
pub fn project_rect(transform: &Matrix4, rect: Rect) -> Vec<Point> {
    let corners = [
        Point::new(rect.min_x(), rect.min_y()),
        Point::new(rect.max_x(), rect.min_y()),
        Point::new(rect.max_x(), rect.max_y()),
        Point::new(rect.min_x(), rect.max_y()),
    ];
    let mapped: Vec<Vec4> = corners
        .iter()
        .map(|corner| transform.map_point_homogeneous(*corner))
        .collect();
    let clipped = clip_polygon_to_image_plane(&mapped, ClipEpsilon::default());
    clipped.into_iter().map(Vec4::project).collect()
}

/// Invert the projection of a screen point back into a layer's z=0 plane.
///
/// Solves the 2x2 linear system obtained from requiring that the mapped
/// homogeneous point projects onto `screen`. Returns `None` when the layer
/// is edge-on to the viewer (degenerate system).
pub fn unproject_point(transform: &Matrix4, screen: Point) -> Option<Point> {
    let a = transform.at(0, 0) - screen.x * transform.at(3, 0);
    let b = transform.at(0, 1) - screen.x * transform.at(3, 1);
    let c = transform.at(1, 0) - screen.y * transform.at(3, 0);
    let d = transform.at(1, 1) - screen.y * transform.at(3, 1);
    let rhs_x = screen.x * transform.at(3, 3) - transform.at(0, 3);
    let rhs_y = screen.y * transform.at(3, 3) - transform.at(1, 3);

    let determinant = a * d - b * c;
    if determinant.abs() < 1e-12 {
        return None;
    }
    let local_x = (rhs_x * d - b * rhs_y) / determinant;
    let local_y = (a * rhs_y - rhs_x * c) / determinant;
    Some(Point::new(local_x, local_y))
}
