//! Shared geometry types for the compositing pipeline.
//!
//! Coordinates follow the document convention: x grows right, y grows down.
//! Pixel-space quantities (tile grids, texture sizes) use the integer types;
//! layer geometry and transforms use the float types.

pub use clip::{
    ClipEpsilon, IMAGE_PLANE_EPSILON, clip_polygon_to_image_plane, project_rect, unproject_point,
};
pub use matrix::{Matrix4, Vec4};

mod clip;
mod matrix;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            origin: Point::new(x, y),
            size: Size::new(width, height),
        }
    }

    pub fn from_size(size: Size) -> Self {
        Self {
            origin: Point::default(),
            size,
        }
    }

    pub fn min_x(self) -> f32 {
        self.origin.x
    }

    pub fn min_y(self) -> f32 {
        self.origin.y
    }

    pub fn max_x(self) -> f32 {
        self.origin.x + self.size.width
    }

    pub fn max_y(self) -> f32 {
        self.origin.y + self.size.height
    }

    pub fn center(self) -> Point {
        Point::new(
            self.origin.x + self.size.width / 2.0,
            self.origin.y + self.size.height / 2.0,
        )
    }

    pub fn is_empty(self) -> bool {
        self.size.is_empty()
    }

    pub fn contains(self, point: Point) -> bool {
        point.x >= self.min_x()
            && point.x < self.max_x()
            && point.y >= self.min_y()
            && point.y < self.max_y()
    }

    pub fn intersects(self, other: Rect) -> bool {
        !self.intersection(other).is_empty()
    }

    pub fn intersection(self, other: Rect) -> Rect {
        let min_x = self.min_x().max(other.min_x());
        let min_y = self.min_y().max(other.min_y());
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());
        if min_x >= max_x || min_y >= max_y {
            return Rect::default();
        }
        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn union(self, other: Rect) -> Rect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let min_x = self.min_x().min(other.min_x());
        let min_y = self.min_y().min(other.min_y());
        let max_x = self.max_x().max(other.max_x());
        let max_y = self.max_y().max(other.max_y());
        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    /// Inflate by independent horizontal/vertical scale factors about the
    /// rect center. Factors below 1.0 are clamped to 1.0; inflation never
    /// shrinks.
    pub fn inflate_anisotropic(self, factor_x: f32, factor_y: f32) -> Rect {
        let factor_x = factor_x.max(1.0);
        let factor_y = factor_y.max(1.0);
        let new_width = self.size.width * factor_x;
        let new_height = self.size.height * factor_y;
        let center = self.center();
        Rect::new(
            center.x - new_width / 2.0,
            center.y - new_height / 2.0,
            new_width,
            new_height,
        )
    }

    pub fn scaled(self, scale: f32) -> Rect {
        Rect::new(
            self.origin.x * scale,
            self.origin.y * scale,
            self.size.width * scale,
            self.size.height * scale,
        )
    }

    /// Smallest integer rect covering this rect.
    pub fn enclosing_int_rect(self) -> IntRect {
        let min_x = self.min_x().floor() as i32;
        let min_y = self.min_y().floor() as i32;
        let max_x = self.max_x().ceil() as i32;
        let max_y = self.max_y().ceil() as i32;
        IntRect::new(
            min_x,
            min_y,
            (max_x - min_x).max(0) as u32,
            (max_y - min_y).max(0) as u32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntSize {
    pub width: u32,
    pub height: u32,
}

impl IntSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area_bytes_rgba8(self) -> usize {
        (self.width as usize) * (self.height as usize) * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntPoint {
    pub x: i32,
    pub y: i32,
}

impl IntPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntRect {
    pub origin: IntPoint,
    pub size: IntSize,
}

impl IntRect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            origin: IntPoint::new(x, y),
            size: IntSize::new(width, height),
        }
    }

    pub fn from_size(size: IntSize) -> Self {
        Self {
            origin: IntPoint::default(),
            size,
        }
    }

    pub fn min_x(self) -> i32 {
        self.origin.x
    }

    pub fn min_y(self) -> i32 {
        self.origin.y
    }

    pub fn max_x(self) -> i32 {
        self.origin.x + self.size.width as i32
    }

    pub fn max_y(self) -> i32 {
        self.origin.y + self.size.height as i32
    }

    pub fn is_empty(self) -> bool {
        self.size.is_empty()
    }

    pub fn intersection(self, other: IntRect) -> IntRect {
        let min_x = self.min_x().max(other.min_x());
        let min_y = self.min_y().max(other.min_y());
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());
        if min_x >= max_x || min_y >= max_y {
            return IntRect::default();
        }
        IntRect::new(min_x, min_y, (max_x - min_x) as u32, (max_y - min_y) as u32)
    }

    pub fn intersects(self, other: IntRect) -> bool {
        !self.intersection(other).is_empty()
    }

    pub fn union(self, other: IntRect) -> IntRect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let min_x = self.min_x().min(other.min_x());
        let min_y = self.min_y().min(other.min_y());
        let max_x = self.max_x().max(other.max_x());
        let max_y = self.max_y().max(other.max_y());
        IntRect::new(min_x, min_y, (max_x - min_x) as u32, (max_y - min_y) as u32)
    }

    pub fn contains_rect(self, other: IntRect) -> bool {
        if other.is_empty() {
            return true;
        }
        other.min_x() >= self.min_x()
            && other.min_y() >= self.min_y()
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }

    pub fn to_rect(self) -> Rect {
        Rect::new(
            self.origin.x as f32,
            self.origin.y as f32,
            self.size.width as f32,
            self.size.height as f32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
    pub const BLACK: Color = Color::rgba(0, 0, 0, 255);
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);

    pub const fn rgba(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    pub fn to_unit_rgba(self) -> [f32; 4] {
        [
            self.red as f32 / 255.0,
            self.green as f32 / 255.0,
            self.blue as f32 / 255.0,
            self.alpha as f32 / 255.0,
        ]
    }
}
