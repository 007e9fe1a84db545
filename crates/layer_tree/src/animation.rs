//! Keyframe animations over layer opacity and transform.

use geometry::Matrix4;
use smol_str::SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimatedProperty {
    Opacity,
    Transform,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnimationValue {
    Opacity(f32),
    Transform(Matrix4),
}

impl AnimationValue {
    pub fn property(&self) -> AnimatedProperty {
        match self {
            AnimationValue::Opacity(_) => AnimatedProperty::Opacity,
            AnimationValue::Transform(_) => AnimatedProperty::Transform,
        }
    }

    /// Componentwise interpolation. Matrices interpolate element by
    /// element, which matches what the compositor can do without a
    /// decomposition step; callers wanting spec-grade transform
    /// interpolation must pre-decompose on the producer side.
    fn lerp(&self, other: &AnimationValue, t: f32) -> AnimationValue {
        match (self, other) {
            (AnimationValue::Opacity(a), AnimationValue::Opacity(b)) => {
                AnimationValue::Opacity(a + (b - a) * t)
            }
            (AnimationValue::Transform(a), AnimationValue::Transform(b)) => {
                let a = a.as_column_major();
                let b = b.as_column_major();
                let mut out = [0.0f32; 16];
                for (index, slot) in out.iter_mut().enumerate() {
                    *slot = a[index] + (b[index] - a[index]) * t;
                }
                AnimationValue::Transform(Matrix4::from_column_major(out))
            }
            _ => panic!("interpolating keyframes of different properties"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyframe {
    /// Position in the animation, 0.0 at the start and 1.0 at the end.
    pub offset: f32,
    pub value: AnimationValue,
}

/// A named, time-based animation of one layer property.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyframeAnimation {
    name: SmolStr,
    property: AnimatedProperty,
    keyframes: Vec<Keyframe>,
    duration: f64,
    start_time: f64,
    /// `None` repeats forever.
    iterations: Option<u32>,
}

impl KeyframeAnimation {
    pub fn new(
        name: impl Into<SmolStr>,
        keyframes: Vec<Keyframe>,
        duration: f64,
        iterations: Option<u32>,
    ) -> Self {
        assert!(!keyframes.is_empty(), "animation needs at least one keyframe");
        assert!(duration > 0.0, "animation duration must be positive");
        assert!(
            keyframes.windows(2).all(|pair| pair[0].offset <= pair[1].offset),
            "keyframes must be sorted by offset"
        );
        let property = keyframes[0].value.property();
        assert!(
            keyframes.iter().all(|frame| frame.value.property() == property),
            "keyframes must all animate the same property"
        );
        Self {
            name: name.into(),
            property,
            keyframes,
            duration,
            start_time: 0.0,
            iterations,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property(&self) -> AnimatedProperty {
        self.property
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn set_start_time(&mut self, start_time: f64) {
        self.start_time = start_time;
    }

    pub fn is_finished(&self, now: f64) -> bool {
        let Some(iterations) = self.iterations else {
            return false;
        };
        now - self.start_time >= self.duration * iterations as f64
    }

    pub fn evaluate(&self, now: f64) -> AnimationValue {
        self.sample(now - self.start_time)
    }

    /// Sample at an elapsed time since start. Suspended animations replay
    /// their frozen elapsed offset through this instead of advancing.
    pub fn sample(&self, elapsed: f64) -> AnimationValue {
        let progress = if elapsed <= 0.0 {
            0.0
        } else {
            let cycles = elapsed / self.duration;
            match self.iterations {
                Some(iterations) if cycles >= iterations as f64 => 1.0,
                _ => {
                    let fract = cycles.fract();
                    // A completed whole cycle samples the end, not the
                    // wrapped-around start.
                    if fract == 0.0 && cycles > 0.0 { 1.0 } else { fract }
                }
            }
        } as f32;

        let first = &self.keyframes[0];
        if progress <= first.offset {
            return first.value.clone();
        }
        let last = self.keyframes.last().expect("keyframes are nonempty");
        if progress >= last.offset {
            return last.value.clone();
        }
        let after = self
            .keyframes
            .iter()
            .position(|frame| frame.offset >= progress)
            .expect("progress is below the last keyframe offset");
        let from = &self.keyframes[after - 1];
        let to = &self.keyframes[after];
        let span = to.offset - from.offset;
        let t = if span <= 0.0 {
            1.0
        } else {
            (progress - from.offset) / span
        };
        from.value.lerp(&to.value, t)
    }
}

/// An animation taken off the active list, remembering how far it had
/// played so resume continues from the same point.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendedAnimation {
    pub animation: KeyframeAnimation,
    pub elapsed: f64,
}
