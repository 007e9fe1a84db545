//! Producer-side compositing layer tree and the commit snapshot model.
//!
//! The page's rendering pipeline owns and mutates a tree of [`Layer`]
//! values on its own thread. The compositing thread never sees these
//! nodes; instead a commit turns the tree into a [`LayerSnapshot`] — a
//! pure-data copy of every producer-authoritative field — which crosses
//! the thread boundary exactly once and is reconciled against the
//! committed tree on the other side. Derived per-frame values (draw
//! transforms, draw opacity, surfaces) live only on the consumer side.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use filters::FilterOperation;
use geometry::{Color, IntSize, Matrix4, Point, Rect, Size};
use smallvec::SmallVec;
use tiler::{ContentPainter, PixelBuffer, TilerConsumer, TilerProducer, tiler_pair};

pub use animation::{
    AnimatedProperty, AnimationValue, Keyframe, KeyframeAnimation, SuspendedAnimation,
};

mod animation;

/// Stable identity shared by a producer layer and its committed twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which edges a fixed-position layer is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedPosition {
    pub is_fixed: bool,
    pub has_fixed_ancestor: bool,
    pub is_container_for_fixed: bool,
    pub pinned_to_top: bool,
    pub pinned_to_left: bool,
}

/// What a layer displays. A closed set: the renderer matches on it
/// exhaustively.
pub enum LayerContent {
    None,
    /// Content painted by the page, split into tiles. The consumer half
    /// of the tiler is parked here until the first commit carries it to
    /// the compositing thread.
    Tiled {
        producer: TilerProducer,
        painter: Box<dyn ContentPainter + Send>,
        pending_consumer: Option<TilerConsumer>,
    },
    /// A still image, uploaded whole (no tiling).
    Image { pixels: Arc<PixelBuffer> },
    SolidColor(Color),
    /// Video/plugin passthrough: the platform draws underneath, we punch
    /// a transparent hole.
    HolePunch,
}

impl std::fmt::Debug for LayerContent {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerContent::None => formatter.write_str("None"),
            LayerContent::Tiled { .. } => formatter.write_str("Tiled"),
            LayerContent::Image { pixels } => {
                write!(formatter, "Image({}x{})", pixels.size.width, pixels.size.height)
            }
            LayerContent::SolidColor(color) => write!(formatter, "SolidColor({color:?})"),
            LayerContent::HolePunch => formatter.write_str("HolePunch"),
        }
    }
}

/// A node of the producer tree.
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    pub position: Point,
    /// Unit coordinates within bounds; (0.5, 0.5) is the center.
    pub anchor_point: Point,
    pub bounds: Size,
    pub transform: Matrix4,
    pub sublayer_transform: Matrix4,
    pub opacity: f32,
    pub preserves_3d: bool,
    pub masks_to_bounds: bool,
    pub fixed: FixedPosition,
    filters: Vec<FilterOperation>,
    content: LayerContent,
    children: Vec<Layer>,
    mask: Option<Box<Layer>>,
    replica: Option<Box<Layer>>,
    animations: SmallVec<[KeyframeAnimation; 2]>,
    suspended_animations: SmallVec<[SuspendedAnimation; 2]>,
}

impl Layer {
    pub fn new() -> Self {
        Self {
            id: LayerId::next(),
            position: Point::default(),
            anchor_point: Point::new(0.5, 0.5),
            bounds: Size::default(),
            transform: Matrix4::IDENTITY,
            sublayer_transform: Matrix4::IDENTITY,
            opacity: 1.0,
            preserves_3d: false,
            masks_to_bounds: false,
            fixed: FixedPosition::default(),
            filters: Vec::new(),
            content: LayerContent::None,
            children: Vec::new(),
            mask: None,
            replica: None,
            animations: SmallVec::new(),
            suspended_animations: SmallVec::new(),
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn content(&self) -> &LayerContent {
        &self.content
    }

    pub fn children(&self) -> &[Layer] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Layer] {
        &mut self.children
    }

    pub fn mask(&self) -> Option<&Layer> {
        self.mask.as_deref()
    }

    pub fn replica(&self) -> Option<&Layer> {
        self.replica.as_deref()
    }

    pub fn filters(&self) -> &[FilterOperation] {
        &self.filters
    }

    pub fn set_bounds(&mut self, bounds: Size) {
        if self.bounds == bounds {
            return;
        }
        self.bounds = bounds;
        if let LayerContent::Tiled { producer, .. } = &mut self.content {
            producer.set_contents_size(IntSize::new(
                bounds.width.ceil().max(0.0) as u32,
                bounds.height.ceil().max(0.0) as u32,
            ));
        }
    }

    /// Give this layer tiled content painted through `painter`. The
    /// consumer half of the tiler travels with the next commit.
    pub fn set_tiled_content(&mut self, painter: Box<dyn ContentPainter + Send>) {
        let contents_size = IntSize::new(
            self.bounds.width.ceil().max(0.0) as u32,
            self.bounds.height.ceil().max(0.0) as u32,
        );
        let (mut producer, consumer) = tiler_pair(contents_size);
        if !self.filters.is_empty() {
            producer.set_render_full_contents(true);
        }
        self.content = LayerContent::Tiled {
            producer,
            painter,
            pending_consumer: Some(consumer),
        };
    }

    pub fn set_image_content(&mut self, pixels: Arc<PixelBuffer>) {
        self.content = LayerContent::Image { pixels };
    }

    pub fn set_solid_color(&mut self, color: Color) {
        self.content = LayerContent::SolidColor(color);
    }

    pub fn set_hole_punch(&mut self) {
        self.content = LayerContent::HolePunch;
    }

    pub fn clear_content(&mut self) {
        self.content = LayerContent::None;
    }

    /// Invalidate the whole layer.
    pub fn set_needs_display(&mut self) {
        if let LayerContent::Tiled { producer, .. } = &mut self.content {
            producer.mark_all_dirty();
        }
    }

    /// Invalidate a sub-region, in layer coordinates.
    pub fn set_needs_display_in_rect(&mut self, rect: Rect) {
        if let LayerContent::Tiled { producer, .. } = &mut self.content {
            producer.mark_dirty(rect.enclosing_int_rect());
        }
    }

    pub fn set_filters(&mut self, filters: Vec<FilterOperation>) {
        self.filters = filters;
        if let LayerContent::Tiled { producer, .. } = &mut self.content {
            // Filter input must be complete, never just the visible slice.
            producer.set_render_full_contents(!self.filters.is_empty());
        }
    }

    pub fn add_child(&mut self, child: Layer) {
        self.children.push(child);
    }

    pub fn insert_child(&mut self, index: usize, child: Layer) {
        self.children.insert(index, child);
    }

    pub fn remove_child(&mut self, id: LayerId) -> Option<Layer> {
        let index = self.children.iter().position(|child| child.id == id)?;
        Some(self.children.remove(index))
    }

    /// Attach an alpha mask. The mask is a side-tree, never part of the
    /// child list, and always renders its full contents. Masks bind as a
    /// single sampled texture, so a tiled mask must not split into the
    /// grid.
    pub fn set_mask(&mut self, mask: Option<Layer>) {
        self.mask = mask.map(|mut mask| {
            if let LayerContent::Tiled { producer, .. } = &mut mask.content {
                producer.set_render_full_contents(true);
                producer.set_single_tile_only(true);
            }
            Box::new(mask)
        });
    }

    pub fn set_replica(&mut self, replica: Option<Layer>) {
        self.replica = replica.map(Box::new);
    }

    pub fn add_animation(&mut self, animation: KeyframeAnimation) {
        self.animations.push(animation);
    }

    pub fn remove_animation(&mut self, name: &str) {
        self.animations.retain(|animation| animation.name() != name);
        self.suspended_animations
            .retain(|suspended| suspended.animation.name() != name);
    }

    pub fn animations(&self) -> &[KeyframeAnimation] {
        &self.animations
    }

    pub fn suspended_animations(&self) -> &[SuspendedAnimation] {
        &self.suspended_animations
    }

    /// Freeze all running animations at their current offset.
    pub fn suspend_animations(&mut self, now: f64) {
        for animation in self.animations.drain(..) {
            let elapsed = now - animation.start_time();
            self.suspended_animations
                .push(SuspendedAnimation { animation, elapsed });
        }
    }

    /// Restart suspended animations from their frozen offset.
    pub fn resume_animations(&mut self, now: f64) {
        for suspended in self.suspended_animations.drain(..) {
            let mut animation = suspended.animation;
            animation.set_start_time(now - suspended.elapsed);
            self.animations.push(animation);
        }
    }

    /// Run the tiling pass for this subtree, painting dirty tiles at
    /// `scale`. Producer thread only.
    pub fn update_contents(&mut self, scale: f32) {
        if let LayerContent::Tiled {
            producer, painter, ..
        } = &mut self.content
        {
            producer.update_if_needed(painter.as_mut(), scale);
        }
        if let Some(mask) = &mut self.mask {
            mask.update_contents(scale);
        }
        if let Some(replica) = &mut self.replica {
            replica.update_contents(scale);
        }
        for child in &mut self.children {
            child.update_contents(scale);
        }
    }

    /// Build the commit payload for this subtree. Flushes each tiled
    /// layer's pending texture jobs into the cross-thread queue and, on
    /// the first commit, hands over the tiler's consumer half.
    pub fn commit_snapshot(&mut self) -> LayerSnapshot {
        let content = match &mut self.content {
            LayerContent::None => SnapshotContent::None,
            LayerContent::Tiled {
                producer,
                pending_consumer,
                ..
            } => {
                producer.commit_pending_jobs();
                SnapshotContent::Tiled {
                    consumer: pending_consumer.take(),
                }
            }
            LayerContent::Image { pixels } => SnapshotContent::Image {
                pixels: pixels.clone(),
            },
            LayerContent::SolidColor(color) => SnapshotContent::SolidColor(*color),
            LayerContent::HolePunch => SnapshotContent::HolePunch,
        };
        LayerSnapshot {
            id: self.id,
            position: self.position,
            anchor_point: self.anchor_point,
            bounds: self.bounds,
            transform: self.transform,
            sublayer_transform: self.sublayer_transform,
            opacity: self.opacity,
            preserves_3d: self.preserves_3d,
            masks_to_bounds: self.masks_to_bounds,
            fixed: self.fixed,
            filters: self.filters.clone(),
            animations: self.animations.to_vec(),
            suspended_animations: self.suspended_animations.to_vec(),
            content,
            children: self
                .children
                .iter_mut()
                .map(Layer::commit_snapshot)
                .collect(),
            mask: self
                .mask
                .as_mut()
                .map(|mask| Box::new(mask.commit_snapshot())),
            replica: self
                .replica
                .as_mut()
                .map(|replica| Box::new(replica.commit_snapshot())),
        }
    }
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}

/// Content as carried by a commit.
#[derive(Debug)]
pub enum SnapshotContent {
    None,
    /// `consumer` is `Some` only on the first commit after the tiled
    /// content was created; later commits rely on the committed layer
    /// already holding it.
    Tiled { consumer: Option<TilerConsumer> },
    Image { pixels: Arc<PixelBuffer> },
    SolidColor(Color),
    HolePunch,
}

/// Pure-data copy of one layer's producer-authoritative state, plus the
/// copied subtree. This is the unit that crosses the thread boundary.
#[derive(Debug)]
pub struct LayerSnapshot {
    pub id: LayerId,
    pub position: Point,
    pub anchor_point: Point,
    pub bounds: Size,
    pub transform: Matrix4,
    pub sublayer_transform: Matrix4,
    pub opacity: f32,
    pub preserves_3d: bool,
    pub masks_to_bounds: bool,
    pub fixed: FixedPosition,
    pub filters: Vec<FilterOperation>,
    pub animations: Vec<KeyframeAnimation>,
    pub suspended_animations: Vec<SuspendedAnimation>,
    pub content: SnapshotContent,
    pub children: Vec<LayerSnapshot>,
    pub mask: Option<Box<LayerSnapshot>>,
    pub replica: Option<Box<LayerSnapshot>>,
}

/// Consumer-thread-writable patch over committed values. A `Some` field
/// wins over the committed value during the transform pass; fields stay
/// set across commits until explicitly cleared. Override animations are
/// additive and removed by name, independent of commits.
#[derive(Debug, Default)]
pub struct LayerOverride {
    pub position: Option<Point>,
    pub anchor_point: Option<Point>,
    pub bounds: Option<Size>,
    pub transform: Option<Matrix4>,
    pub opacity: Option<f32>,
    pub animations: Vec<KeyframeAnimation>,
}

impl LayerOverride {
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.anchor_point.is_none()
            && self.bounds.is_none()
            && self.transform.is_none()
            && self.opacity.is_none()
            && self.animations.is_empty()
    }

    pub fn remove_animation(&mut self, name: &str) {
        self.animations.retain(|animation| animation.name() != name);
    }

    pub fn clear(&mut self) {
        *self = LayerOverride::default();
    }
}
