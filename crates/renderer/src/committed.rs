//! The committed (consumer-side) layer tree.
//!
//! Each producer commit delivers a [`LayerSnapshot`]; reconciliation
//! matches snapshot nodes to committed nodes by [`LayerId`] so that
//! consumer-exclusive state — tiler consumer halves, override patches,
//! offscreen surfaces, uploaded image textures — survives across commits
//! while producer-authoritative fields are replaced wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use filters::FilterOperation;
use geometry::{Color, Matrix4, Point, Rect, Size};
use layer_tree::{
    FixedPosition, KeyframeAnimation, LayerId, LayerOverride, LayerSnapshot, SnapshotContent,
    SuspendedAnimation,
};
use texture_cache::{TextureCache, TextureKey};
use tiler::{PixelBuffer, TilerConsumer};

use crate::surface::RendererSurface;

/// Consumer-side content state.
#[derive(Debug)]
pub enum CommittedContent {
    None,
    /// `consumer` is `None` until the first commit for this layer has
    /// carried the tiler's consumer half across; the layer simply draws
    /// nothing until then.
    Tiled { consumer: Option<TilerConsumer> },
    Image {
        pixels: Arc<PixelBuffer>,
        texture: Option<TextureKey>,
        uploaded: bool,
    },
    SolidColor(Color),
    HolePunch,
}

/// Values produced by the animation pass, consumed by the transform pass
/// within the same frame.
#[derive(Debug, Default, Clone)]
pub(crate) struct AnimatedState {
    pub opacity: Option<f32>,
    pub transform: Option<Matrix4>,
}

/// One node of the committed tree plus its per-frame derived state. The
/// derived fields are recomputed every frame by `update_layers` and must
/// never be trusted across a frame boundary.
#[derive(Debug)]
pub struct CommittedLayer {
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
    pub content: CommittedContent,
    pub children: Vec<CommittedLayer>,
    pub mask: Option<Box<CommittedLayer>>,
    pub replica: Option<Box<CommittedLayer>>,
    /// UI-thread patch; survives commits, cleared explicitly.
    pub override_patch: LayerOverride,

    pub(crate) animated: AnimatedState,
    pub(crate) draw_transform: Matrix4,
    pub(crate) draw_opacity: f32,
    /// Opacity the layer's own content draws with. Equal to
    /// `draw_opacity` except for surface-backed layers, whose content
    /// renders opaque into the surface.
    pub(crate) content_opacity: f32,
    /// Screen-space axis-aligned bounds after projection.
    pub(crate) bounding_box: Rect,
    /// Projective w of the layer center, for preserve-3D depth sorting.
    pub(crate) center_w: f32,
    pub(crate) clip_rect: Rect,
    pub(crate) visible: bool,
    pub(crate) needs_stencil: bool,
    pub(crate) content_changed: bool,
    pub(crate) surface: Option<RendererSurface>,
}

impl CommittedLayer {
    pub fn from_snapshot(snapshot: LayerSnapshot) -> Self {
        let mut layer = Self {
            id: snapshot.id,
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
            animations: Vec::new(),
            suspended_animations: Vec::new(),
            content: CommittedContent::None,
            children: Vec::new(),
            mask: None,
            replica: None,
            override_patch: LayerOverride::default(),
            animated: AnimatedState::default(),
            draw_transform: Matrix4::IDENTITY,
            draw_opacity: 1.0,
            content_opacity: 1.0,
            bounding_box: Rect::default(),
            center_w: 1.0,
            clip_rect: Rect::default(),
            visible: false,
            needs_stencil: false,
            content_changed: false,
            surface: None,
        };
        layer.apply_snapshot_fields(snapshot, &mut None);
        layer
    }

    /// Apply one commit to this subtree. `cache` receives texture
    /// releases for nodes and content the commit removed.
    pub fn apply_snapshot(&mut self, snapshot: LayerSnapshot, cache: &mut TextureCache) {
        assert_eq!(self.id, snapshot.id, "commit applied to a different layer");
        let mut cache = Some(cache);
        self.apply_snapshot_fields(snapshot, &mut cache);
    }

    fn apply_snapshot_fields(
        &mut self,
        snapshot: LayerSnapshot,
        cache: &mut Option<&mut TextureCache>,
    ) {
        self.position = snapshot.position;
        self.anchor_point = snapshot.anchor_point;
        self.bounds = snapshot.bounds;
        self.transform = snapshot.transform;
        self.sublayer_transform = snapshot.sublayer_transform;
        self.opacity = snapshot.opacity;
        self.preserves_3d = snapshot.preserves_3d;
        self.masks_to_bounds = snapshot.masks_to_bounds;
        self.fixed = snapshot.fixed;
        self.filters = snapshot.filters;
        self.animations = snapshot.animations;
        self.suspended_animations = snapshot.suspended_animations;

        self.apply_content(snapshot.content, cache);

        // Re-link children by id so consumer-side state follows the node.
        let mut existing: HashMap<LayerId, CommittedLayer> = self
            .children
            .drain(..)
            .map(|child| (child.id, child))
            .collect();
        self.children = snapshot
            .children
            .into_iter()
            .map(|child_snapshot| match existing.remove(&child_snapshot.id) {
                Some(mut child) => {
                    child.apply_snapshot_fields(child_snapshot, cache);
                    child
                }
                None => CommittedLayer::from_snapshot(child_snapshot),
            })
            .collect();
        for (_, mut removed) in existing {
            removed.release_resources_inner(cache);
        }

        self.mask = reconcile_side_tree(self.mask.take(), snapshot.mask, cache);
        self.replica = reconcile_side_tree(self.replica.take(), snapshot.replica, cache);
    }

    fn apply_content(
        &mut self,
        content: SnapshotContent,
        cache: &mut Option<&mut TextureCache>,
    ) {
        match content {
            SnapshotContent::None => {
                self.release_content(cache);
                self.content = CommittedContent::None;
            }
            SnapshotContent::Tiled { consumer } => match (&mut self.content, consumer) {
                (CommittedContent::Tiled { consumer: slot }, Some(new_consumer)) => {
                    if let (Some(mut old), Some(cache)) = (slot.take(), cache.as_deref_mut()) {
                        old.release_textures(cache);
                    }
                    *slot = Some(new_consumer);
                }
                (CommittedContent::Tiled { .. }, None) => {}
                (_, consumer) => {
                    self.release_content(cache);
                    self.content = CommittedContent::Tiled { consumer };
                }
            },
            SnapshotContent::Image { pixels } => {
                if let CommittedContent::Image {
                    pixels: current,
                    uploaded,
                    ..
                } = &mut self.content
                {
                    if !Arc::ptr_eq(current, &pixels) {
                        *current = pixels;
                        *uploaded = false;
                    }
                } else {
                    self.release_content(cache);
                    self.content = CommittedContent::Image {
                        pixels,
                        texture: None,
                        uploaded: false,
                    };
                }
            }
            SnapshotContent::SolidColor(color) => {
                self.release_content(cache);
                self.content = CommittedContent::SolidColor(color);
            }
            SnapshotContent::HolePunch => {
                self.release_content(cache);
                self.content = CommittedContent::HolePunch;
            }
        }
    }

    fn release_content(&mut self, cache: &mut Option<&mut TextureCache>) {
        let Some(cache) = cache.as_deref_mut() else {
            self.content = CommittedContent::None;
            return;
        };
        match &mut self.content {
            CommittedContent::Tiled {
                consumer: Some(consumer),
            } => consumer.release_textures(cache),
            CommittedContent::Image {
                texture: Some(texture),
                ..
            } => cache.release(*texture),
            _ => {}
        }
        self.content = CommittedContent::None;
    }

    /// Release every texture this subtree owns. Must be called before the
    /// tree is dropped; textures are never reclaimed implicitly.
    pub fn release_resources(&mut self, cache: &mut TextureCache) {
        let mut cache = Some(cache);
        self.release_resources_inner(&mut cache);
    }

    fn release_resources_inner(&mut self, cache: &mut Option<&mut TextureCache>) {
        self.release_content(cache);
        if let (Some(mut surface), Some(cache)) = (self.surface.take(), cache.as_deref_mut()) {
            surface.release(cache);
        }
        for child in &mut self.children {
            child.release_resources_inner(cache);
        }
        if let Some(mask) = &mut self.mask {
            mask.release_resources_inner(cache);
        }
        if let Some(replica) = &mut self.replica {
            replica.release_resources_inner(cache);
        }
    }

    pub fn find(&self, id: LayerId) -> Option<&CommittedLayer> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: LayerId) -> Option<&mut CommittedLayer> {
        if self.id == id {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(id))
    }

    pub fn draw_opacity(&self) -> f32 {
        self.draw_opacity
    }

    pub fn draw_transform(&self) -> Matrix4 {
        self.draw_transform
    }

    pub fn bounding_box(&self) -> Rect {
        self.bounding_box
    }

    /// Effective values: override beats animation beats committed.
    pub(crate) fn effective_opacity(&self) -> f32 {
        self.override_patch
            .opacity
            .or(self.animated.opacity)
            .unwrap_or(self.opacity)
    }

    pub(crate) fn effective_transform(&self) -> Matrix4 {
        self.override_patch
            .transform
            .or(self.animated.transform)
            .unwrap_or(self.transform)
    }

    pub(crate) fn effective_position(&self) -> Point {
        self.override_patch.position.unwrap_or(self.position)
    }

    pub(crate) fn effective_anchor_point(&self) -> Point {
        self.override_patch.anchor_point.unwrap_or(self.anchor_point)
    }

    pub(crate) fn effective_bounds(&self) -> Size {
        self.override_patch.bounds.unwrap_or(self.bounds)
    }

    /// Whether compositing this layer requires an offscreen surface.
    pub(crate) fn needs_surface(&self) -> bool {
        self.mask.is_some()
            || self.replica.is_some()
            || self.filters.iter().any(|filter| !filter.is_identity())
    }
}

fn reconcile_side_tree(
    current: Option<Box<CommittedLayer>>,
    snapshot: Option<Box<LayerSnapshot>>,
    cache: &mut Option<&mut TextureCache>,
) -> Option<Box<CommittedLayer>> {
    match (current, snapshot) {
        (Some(mut current), Some(snapshot)) if current.id == snapshot.id => {
            current.apply_snapshot_fields(*snapshot, cache);
            Some(current)
        }
        (current, snapshot) => {
            if let Some(mut removed) = current {
                removed.release_resources_inner(cache);
            }
            snapshot.map(|snapshot| Box::new(CommittedLayer::from_snapshot(*snapshot)))
        }
    }
}
