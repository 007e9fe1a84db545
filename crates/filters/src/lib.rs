//! CSS filter chains and their translation into render passes.
//!
//! A layer's filter list is declarative; executing it on the GPU means one
//! fullscreen pass per shader program, ping-ponging between two
//! intermediate textures. Planning happens here so it can be tested
//! without a device; execution lives in the renderer.

use geometry::{Color, Point};

/// One operation of a CSS `filter:` list, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOperation {
    /// 0.0 leaves the image untouched, 1.0 is fully grayscale.
    Grayscale(f32),
    Sepia(f32),
    /// 1.0 is identity; above 1.0 oversaturates.
    Saturate(f32),
    /// Degrees.
    HueRotate(f32),
    Invert(f32),
    /// 1.0 is identity.
    Brightness(f32),
    /// 1.0 is identity.
    Contrast(f32),
    /// Multiplies the alpha channel; 1.0 is identity.
    Opacity(f32),
    /// Gaussian blur standard deviation in pixels.
    Blur(f32),
    DropShadow {
        offset: Point,
        blur: f32,
        color: Color,
    },
}

impl FilterOperation {
    /// True when applying the operation would not change any pixel.
    pub fn is_identity(&self) -> bool {
        match self {
            FilterOperation::Grayscale(amount)
            | FilterOperation::Sepia(amount)
            | FilterOperation::Invert(amount) => *amount == 0.0,
            FilterOperation::Saturate(amount)
            | FilterOperation::Brightness(amount)
            | FilterOperation::Contrast(amount)
            | FilterOperation::Opacity(amount) => *amount == 1.0,
            FilterOperation::HueRotate(degrees) => *degrees % 360.0 == 0.0,
            FilterOperation::Blur(sigma) => *sigma <= 0.0,
            FilterOperation::DropShadow { .. } => false,
        }
    }
}

/// Shader program selector for a single filter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterProgram {
    /// Plain copy. Used to pad a chain to an even pass count.
    Passthrough,
    Grayscale,
    Sepia,
    Saturate,
    HueRotate,
    Invert,
    Brightness,
    Contrast,
    Opacity,
    /// Separable Gaussian, vertical taps.
    BlurY,
    /// Separable Gaussian, horizontal taps.
    BlurX,
    /// Offset copy of the source alpha, tinted with the shadow color.
    /// Executors snapshot the source here; the composite needs it after
    /// the ping-pong chain has overwritten it.
    ShadowCast,
    /// Draw the snapshotted content over the blurred shadow.
    ShadowComposite,
}

/// Which texture a pass samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassSource {
    /// The content snapshot captured at the shadow cast: the layer as
    /// filtered by every pass before the shadow forked off.
    LayerContents,
    /// Output of the previous pass.
    Previous,
}

/// A single fullscreen render pass of a planned filter chain.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterAction {
    pub program: FilterProgram,
    pub source: PassSource,
    /// Program-specific scalar (grayscale amount, blur sigma, ...).
    pub amount: f32,
    pub offset: Point,
    pub color: Color,
}

impl FilterAction {
    fn simple(program: FilterProgram, amount: f32) -> Self {
        Self {
            program,
            source: PassSource::Previous,
            amount,
            offset: Point::default(),
            color: Color::TRANSPARENT,
        }
    }
}

/// Expand a filter list into render passes.
///
/// Passes ping-pong between two buffers, with the chain's final write
/// landing back on the buffer the composite step samples. An odd-length
/// chain is padded with a passthrough pass so the final write always lands
/// on the same side. Identity operations are skipped during planning
/// rather than executed.
pub fn plan_filter_actions(operations: &[FilterOperation]) -> Vec<FilterAction> {
    let mut actions = Vec::new();
    for operation in operations {
        if operation.is_identity() {
            continue;
        }
        match operation {
            FilterOperation::Grayscale(amount) => {
                actions.push(FilterAction::simple(FilterProgram::Grayscale, *amount));
            }
            FilterOperation::Sepia(amount) => {
                actions.push(FilterAction::simple(FilterProgram::Sepia, *amount));
            }
            FilterOperation::Saturate(amount) => {
                actions.push(FilterAction::simple(FilterProgram::Saturate, *amount));
            }
            FilterOperation::HueRotate(degrees) => {
                actions.push(FilterAction::simple(FilterProgram::HueRotate, *degrees));
            }
            FilterOperation::Invert(amount) => {
                actions.push(FilterAction::simple(FilterProgram::Invert, *amount));
            }
            FilterOperation::Brightness(amount) => {
                actions.push(FilterAction::simple(FilterProgram::Brightness, *amount));
            }
            FilterOperation::Contrast(amount) => {
                actions.push(FilterAction::simple(FilterProgram::Contrast, *amount));
            }
            FilterOperation::Opacity(amount) => {
                actions.push(FilterAction::simple(FilterProgram::Opacity, *amount));
            }
            FilterOperation::Blur(sigma) => {
                // Separable Gaussian: vertical taps first, then horizontal.
                actions.push(FilterAction::simple(FilterProgram::BlurY, *sigma));
                actions.push(FilterAction::simple(FilterProgram::BlurX, *sigma));
            }
            FilterOperation::DropShadow {
                offset,
                blur,
                color,
            } => {
                actions.push(FilterAction {
                    program: FilterProgram::ShadowCast,
                    source: PassSource::Previous,
                    amount: 0.0,
                    offset: *offset,
                    color: *color,
                });
                actions.push(FilterAction::simple(FilterProgram::BlurY, *blur));
                actions.push(FilterAction::simple(FilterProgram::BlurX, *blur));
                // The shadow pass destroyed the source pixels in the
                // ping-pong chain, so the composite samples the snapshot
                // taken at the cast.
                actions.push(FilterAction {
                    program: FilterProgram::ShadowComposite,
                    source: PassSource::LayerContents,
                    amount: 0.0,
                    offset: Point::default(),
                    color: Color::TRANSPARENT,
                });
            }
        }
    }
    if actions.len() % 2 == 1 {
        actions.push(FilterAction::simple(FilterProgram::Passthrough, 0.0));
    }
    actions
}
