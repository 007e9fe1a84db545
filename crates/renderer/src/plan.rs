//! The frame plan: an ordered list of draw operations.
//!
//! Compositing emits these instead of touching the GPU directly. The GPU
//! backend replays them verbatim; tests assert on them.

use filters::FilterAction;
use geometry::{Color, IntRect, Matrix4, Point, Rect};
use layer_tree::LayerId;
use texture_cache::TextureKey;

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    /// Punch a transparent hole so a platform surface underneath shows
    /// through. Issued before any textured draw of the same layer.
    HolePunch { rect: Rect, transform: Matrix4 },
    /// One tile of a tiled layer. `rect` is in layer texture space.
    DrawTile {
        layer: LayerId,
        texture: TextureKey,
        rect: Rect,
        transform: Matrix4,
        opacity: f32,
    },
    /// A whole image layer.
    DrawImage {
        layer: LayerId,
        texture: TextureKey,
        rect: Rect,
        transform: Matrix4,
        opacity: f32,
    },
    /// A solid-color layer, via the shared 1x1 color texture.
    DrawColor {
        layer: LayerId,
        texture: TextureKey,
        rect: Rect,
        transform: Matrix4,
        opacity: f32,
        color: Color,
    },
    /// Composite a finished offscreen surface, optionally through its
    /// host's alpha mask.
    DrawSurface {
        layer: LayerId,
        texture: TextureKey,
        rect: Rect,
        transform: Matrix4,
        opacity: f32,
        mask: Option<TextureKey>,
    },
    DebugBorder {
        rect: Rect,
        transform: Matrix4,
        color: Color,
    },
    /// Restrict subsequent draws to `rect` (device pixels). Closing a
    /// nested clip scope re-emits the enclosing rect; `None` means no
    /// clip is in force at all.
    SetScissor { rect: Option<IntRect> },
    /// Rotated clip that a scissor rect cannot express: raise the stencil
    /// value inside `quad`, then test against `depth` while drawing.
    BeginStencilClip { quad: Vec<Point>, depth: u32 },
    EndStencilClip { depth: u32 },
    /// Redirect subsequent draws into a layer's offscreen surface.
    /// `scratch` is the ping-pong partner for any filter passes.
    BeginSurface {
        layer: LayerId,
        texture: TextureKey,
        scratch: Option<TextureKey>,
    },
    EndSurface { layer: LayerId },
    /// One ping-pong filter pass over a surface's content.
    FilterPass { layer: LayerId, action: FilterAction },
}

/// Everything `composite_layers` hands the embedder and the GPU backend
/// for one frame.
#[derive(Debug, Default)]
pub struct FramePlan {
    pub ops: Vec<DrawOp>,
    /// Union of regions whose pixels changed since the previous frame,
    /// device coordinates.
    pub dirty_rect: Rect,
    /// Rects to report to the platform compositor for video/plugin
    /// passthrough.
    pub hole_punch_rects: Vec<Rect>,
    /// True when some content could not be drawn this frame (pending
    /// tiles, running animations) and another frame should be scheduled.
    pub needs_another_frame: bool,
}

impl FramePlan {
    /// Count of stencil clip scopes in the plan, used to verify the
    /// rotated-clip path is exercised.
    pub fn stencil_scope_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DrawOp::BeginStencilClip { .. }))
            .count()
    }
}
