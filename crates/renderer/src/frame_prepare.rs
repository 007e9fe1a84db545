//! Frame phase 1: animation advancement and texture realization.

use geometry::IntPoint;
use layer_tree::AnimationValue;
use texture_cache::{BackingPolicy, BufferAllocator, TextureCache};

use crate::committed::{AnimatedState, CommittedContent, CommittedLayer};
use crate::Renderer;

impl Renderer {
    /// Advance animations and realize pending texture uploads for the
    /// whole tree. Uploads run unconditionally, for invisible layers and
    /// mask/replica side-trees too; deferring them would let the upload
    /// backlog grow without bound. Returns true when an unfinished
    /// animation needs another frame.
    pub fn prepare_frame(
        &mut self,
        root: &mut CommittedLayer,
        now: f64,
        allocator: &mut dyn BufferAllocator,
    ) -> bool {
        let mut needs_another_frame = false;
        prepare_layer(root, now, &mut self.cache, allocator, &mut needs_another_frame);
        needs_another_frame
    }
}

fn prepare_layer(
    layer: &mut CommittedLayer,
    now: f64,
    cache: &mut TextureCache,
    allocator: &mut dyn BufferAllocator,
    needs_another_frame: &mut bool,
) {
    layer.animated = AnimatedState::default();

    // Suspended animations replay their frozen offset; they never demand
    // another frame. Running animations applied after so they win.
    for suspended in &layer.suspended_animations {
        apply_animated_value(
            &mut layer.animated,
            suspended.animation.sample(suspended.elapsed),
        );
    }
    for animation in &layer.animations {
        apply_animated_value(&mut layer.animated, animation.evaluate(now));
        if !animation.is_finished(now) {
            *needs_another_frame = true;
        }
    }
    // Override animations are injected by the UI thread on top of the
    // committed set.
    for animation in &layer.override_patch.animations {
        apply_animated_value(&mut layer.animated, animation.evaluate(now));
        if !animation.is_finished(now) {
            *needs_another_frame = true;
        }
    }

    layer.content_changed = false;
    match &mut layer.content {
        CommittedContent::Tiled {
            consumer: Some(consumer),
        } => {
            if consumer.upload_if_needed(cache, allocator) {
                layer.content_changed = true;
            }
        }
        CommittedContent::Image {
            pixels,
            texture,
            uploaded,
        } if !*uploaded => {
            let key = *texture.get_or_insert_with(|| cache.create_texture());
            if cache.install(key, pixels.size, BackingPolicy::BackedWhenNecessary, allocator) {
                cache.protect(key);
                allocator.upload(
                    cache.buffer_of(key).expect("installed texture has a buffer"),
                    &pixels.bytes,
                    pixels.size,
                    IntPoint::default(),
                );
                cache
                    .unprotect(key)
                    .expect("protect/unprotect must balance across upload");
                *uploaded = true;
                layer.content_changed = true;
            }
            // Allocation failure leaves `uploaded` false; retried next
            // frame.
        }
        _ => {}
    }

    if let Some(mask) = &mut layer.mask {
        prepare_layer(mask, now, cache, allocator, needs_another_frame);
    }
    if let Some(replica) = &mut layer.replica {
        prepare_layer(replica, now, cache, allocator, needs_another_frame);
    }
    for child in &mut layer.children {
        prepare_layer(child, now, cache, allocator, needs_another_frame);
    }
}

fn apply_animated_value(animated: &mut AnimatedState, value: AnimationValue) {
    match value {
        AnimationValue::Opacity(opacity) => animated.opacity = Some(opacity),
        AnimationValue::Transform(transform) => animated.transform = Some(transform),
    }
}
