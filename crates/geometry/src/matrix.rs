//! Column-major 4x4 matrices and homogeneous vectors.
//!
//! Element (row, column) lives at `column * 4 + row`, matching the layout
//! the GPU uniform buffers expect, so `as_column_major` is a plain copy.

use crate::Point;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vec4 {
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Perspective divide. Callers must clip against the image plane first;
    /// dividing by a w at or below the clip epsilon is a bug.
    pub fn project(self) -> Point {
        Point::new(self.x / self.w, self.y / self.w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix4 {
    elements: [f32; 16],
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix4 {
    pub const IDENTITY: Matrix4 = Matrix4 {
        elements: [
            1.0, 0.0, 0.0, 0.0, // col0
            0.0, 1.0, 0.0, 0.0, // col1
            0.0, 0.0, 1.0, 0.0, // col2
            0.0, 0.0, 0.0, 1.0, // col3
        ],
    };

    pub const fn from_column_major(elements: [f32; 16]) -> Self {
        Self { elements }
    }

    pub const fn as_column_major(&self) -> [f32; 16] {
        self.elements
    }

    pub fn at(&self, row: usize, column: usize) -> f32 {
        assert!(row < 4 && column < 4, "matrix index out of range");
        self.elements[column * 4 + row]
    }

    pub fn set(&mut self, row: usize, column: usize, value: f32) {
        assert!(row < 4 && column < 4, "matrix index out of range");
        self.elements[column * 4 + row] = value;
    }

    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        let mut matrix = Self::IDENTITY;
        matrix.set(0, 3, x);
        matrix.set(1, 3, y);
        matrix.set(2, 3, z);
        matrix
    }

    pub fn scaling(x: f32, y: f32, z: f32) -> Self {
        let mut matrix = Self::IDENTITY;
        matrix.set(0, 0, x);
        matrix.set(1, 1, y);
        matrix.set(2, 2, z);
        matrix
    }

    pub fn rotation_x(radians: f32) -> Self {
        let (sin, cos) = radians.sin_cos();
        let mut matrix = Self::IDENTITY;
        matrix.set(1, 1, cos);
        matrix.set(1, 2, -sin);
        matrix.set(2, 1, sin);
        matrix.set(2, 2, cos);
        matrix
    }

    pub fn rotation_y(radians: f32) -> Self {
        let (sin, cos) = radians.sin_cos();
        let mut matrix = Self::IDENTITY;
        matrix.set(0, 0, cos);
        matrix.set(0, 2, sin);
        matrix.set(2, 0, -sin);
        matrix.set(2, 2, cos);
        matrix
    }

    pub fn rotation_z(radians: f32) -> Self {
        let (sin, cos) = radians.sin_cos();
        let mut matrix = Self::IDENTITY;
        matrix.set(0, 0, cos);
        matrix.set(0, 1, -sin);
        matrix.set(1, 0, sin);
        matrix.set(1, 1, cos);
        matrix
    }

    /// CSS `perspective(distance)`.
    pub fn perspective(distance: f32) -> Self {
        assert!(distance != 0.0, "perspective distance must be nonzero");
        let mut matrix = Self::IDENTITY;
        matrix.set(3, 2, -1.0 / distance);
        matrix
    }

    /// Orthographic projection mapping the document rect to clip space,
    /// y flipped so document-down renders screen-down.
    pub fn orthographic(left: f32, right: f32, top: f32, bottom: f32) -> Self {
        assert!(right != left && bottom != top, "degenerate projection rect");
        let mut matrix = Self::IDENTITY;
        matrix.set(0, 0, 2.0 / (right - left));
        matrix.set(1, 1, -2.0 / (bottom - top));
        matrix.set(0, 3, -(right + left) / (right - left));
        matrix.set(1, 3, (bottom + top) / (bottom - top));
        matrix
    }

    pub fn multiply(&self, other: &Matrix4) -> Matrix4 {
        let mut result = Matrix4::from_column_major([0.0; 16]);
        for row in 0..4 {
            for column in 0..4 {
                let mut accumulated = 0.0;
                for term in 0..4 {
                    accumulated += self.at(row, term) * other.at(term, column);
                }
                result.set(row, column, accumulated);
            }
        }
        result
    }

    pub fn map_vec4(&self, vector: Vec4) -> Vec4 {
        let input = [vector.x, vector.y, vector.z, vector.w];
        let mut output = [0.0f32; 4];
        for row in 0..4 {
            let mut accumulated = 0.0;
            for column in 0..4 {
                accumulated += self.at(row, column) * input[column];
            }
            output[row] = accumulated;
        }
        Vec4::new(output[0], output[1], output[2], output[3])
    }

    /// Map a z=0 point through the matrix without projecting.
    pub fn map_point_homogeneous(&self, point: Point) -> Vec4 {
        self.map_vec4(Vec4::new(point.x, point.y, 0.0, 1.0))
    }

    /// Map and project a z=0 point. Only valid when the mapped w is safely
    /// positive; perspective content must go through the clipper instead.
    pub fn map_point(&self, point: Point) -> Point {
        self.map_point_homogeneous(point).project()
    }

    /// True when the bottom row carries perspective terms.
    pub fn has_perspective(&self) -> bool {
        self.at(3, 0) != 0.0 || self.at(3, 1) != 0.0 || self.at(3, 2) != 0.0 || self.at(3, 3) != 1.0
    }

    /// True when the transform has a rotational component out of the z=0
    /// plane. Such transforms cannot be clipped with an axis-aligned
    /// scissor rect and force the stencil path.
    pub fn has_out_of_plane_rotation(&self) -> bool {
        const TOLERANCE: f32 = 1e-5;
        self.at(2, 0).abs() > TOLERANCE
            || self.at(2, 1).abs() > TOLERANCE
            || self.at(0, 2).abs() > TOLERANCE
            || self.at(1, 2).abs() > TOLERANCE
    }

    /// True when mapping z=0 points never rotates axes: only translation
    /// and positive scale in the plane.
    pub fn is_axis_aligned_2d(&self) -> bool {
        const TOLERANCE: f32 = 1e-5;
        !self.has_perspective()
            && !self.has_out_of_plane_rotation()
            && self.at(0, 1).abs() <= TOLERANCE
            && self.at(1, 0).abs() <= TOLERANCE
            && self.at(0, 0) > 0.0
            && self.at(1, 1) > 0.0
    }

    /// CSS flattening: discard the z dimension so children of a
    /// non-preserve-3d layer paint into their parent's plane.
    pub fn flattened_to_2d(&self) -> Matrix4 {
        let mut flattened = *self;
        flattened.set(2, 0, 0.0);
        flattened.set(2, 1, 0.0);
        flattened.set(0, 2, 0.0);
        flattened.set(1, 2, 0.0);
        flattened.set(2, 2, 1.0);
        flattened.set(3, 2, 0.0);
        flattened.set(2, 3, 0.0);
        flattened
    }

    /// Full inverse via cofactor expansion. Returns `None` for singular
    /// matrices (determinant within f32 noise of zero).
    pub fn inverse(&self) -> Option<Matrix4> {
        let m = &self.elements;
        let mut inv = [0.0f32; 16];

        inv[0] = m[5] * m[10] * m[15] - m[5] * m[11] * m[14] - m[9] * m[6] * m[15]
            + m[9] * m[7] * m[14]
            + m[13] * m[6] * m[11]
            - m[13] * m[7] * m[10];
        inv[4] = -m[4] * m[10] * m[15] + m[4] * m[11] * m[14] + m[8] * m[6] * m[15]
            - m[8] * m[7] * m[14]
            - m[12] * m[6] * m[11]
            + m[12] * m[7] * m[10];
        inv[8] = m[4] * m[9] * m[15] - m[4] * m[11] * m[13] - m[8] * m[5] * m[15]
            + m[8] * m[7] * m[13]
            + m[12] * m[5] * m[11]
            - m[12] * m[7] * m[9];
        inv[12] = -m[4] * m[9] * m[14] + m[4] * m[10] * m[13] + m[8] * m[5] * m[14]
            - m[8] * m[6] * m[13]
            - m[12] * m[5] * m[10]
            + m[12] * m[6] * m[9];
        inv[1] = -m[1] * m[10] * m[15] + m[1] * m[11] * m[14] + m[9] * m[2] * m[15]
            - m[9] * m[3] * m[14]
            - m[13] * m[2] * m[11]
            + m[13] * m[3] * m[10];
        inv[5] = m[0] * m[10] * m[15] - m[0] * m[11] * m[14] - m[8] * m[2] * m[15]
            + m[8] * m[3] * m[14]
            + m[12] * m[2] * m[11]
            - m[12] * m[3] * m[10];
        inv[9] = -m[0] * m[9] * m[15] + m[0] * m[11] * m[13] + m[8] * m[1] * m[15]
            - m[8] * m[3] * m[13]
            - m[12] * m[1] * m[11]
            + m[12] * m[3] * m[9];
        inv[13] = m[0] * m[9] * m[14] - m[0] * m[10] * m[13] - m[8] * m[1] * m[14]
            + m[8] * m[2] * m[13]
            + m[12] * m[1] * m[10]
            - m[12] * m[2] * m[9];
        inv[2] = m[1] * m[6] * m[15] - m[1] * m[7] * m[14] - m[5] * m[2] * m[15]
            + m[5] * m[3] * m[14]
            + m[13] * m[2] * m[7]
            - m[13] * m[3] * m[6];
        inv[6] = -m[0] * m[6] * m[15] + m[0] * m[7] * m[14] + m[4] * m[2] * m[15]
            - m[4] * m[3] * m[14]
            - m[12] * m[2] * m[7]
            + m[12] * m[3] * m[6];
        inv[10] = m[0] * m[5] * m[15] - m[0] * m[7] * m[13] - m[4] * m[1] * m[15]
            + m[4] * m[3] * m[13]
            + m[12] * m[1] * m[7]
            - m[12] * m[3] * m[5];
        inv[14] = -m[0] * m[5] * m[14] + m[0] * m[6] * m[13] + m[4] * m[1] * m[14]
            - m[4] * m[2] * m[13]
            - m[12] * m[1] * m[6]
            + m[12] * m[2] * m[5];
        inv[3] = -m[1] * m[6] * m[11] + m[1] * m[7] * m[10] + m[5] * m[2] * m[11]
            - m[5] * m[3] * m[10]
            - m[9] * m[2] * m[7]
            + m[9] * m[3] * m[6];
        inv[7] = m[0] * m[6] * m[11] - m[0] * m[7] * m[10] - m[4] * m[2] * m[11]
            + m[4] * m[3] * m[10]
            + m[8] * m[2] * m[7]
            - m[8] * m[3] * m[6];
        inv[11] = -m[0] * m[5] * m[11] + m[0] * m[7] * m[9] + m[4] * m[1] * m[11]
            - m[4] * m[3] * m[9]
            - m[8] * m[1] * m[7]
            + m[8] * m[3] * m[5];
        inv[15] = m[0] * m[5] * m[10] - m[0] * m[6] * m[9] - m[4] * m[1] * m[10]
            + m[4] * m[2] * m[9]
            + m[8] * m[1] * m[6]
            - m[8] * m[2] * m[5];

        let determinant = m[0] * inv[0] + m[1] * inv[4] + m[2] * inv[8] + m[3] * inv[12];
        if determinant.abs() < 1e-12 {
            return None;
        }
        let reciprocal = 1.0 / determinant;
        for element in inv.iter_mut() {
            *element *= reciprocal;
        }
        Some(Matrix4::from_column_major(inv))
    }
}
