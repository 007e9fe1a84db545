use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use geometry::{Color, IntPoint, IntSize, Point, Rect, Size};
use layer_tree::{AnimationValue, Keyframe, KeyframeAnimation, Layer};
use renderer::{DrawOp, FramePlan, Viewport};
use texture_cache::{BackingPolicy, BufferAllocator, GpuBufferId};

use crate::{CompositingHost, CompositorThread, FrameSink, SceneProducer, scene_pair};

#[derive(Default)]
struct RecordingAllocator {
    next_id: u64,
    live: HashSet<GpuBufferId>,
}

impl BufferAllocator for RecordingAllocator {
    fn allocate(&mut self, size: IntSize, _policy: BackingPolicy) -> Option<GpuBufferId> {
        if size.is_empty() {
            return None;
        }
        self.next_id += 1;
        let id = GpuBufferId(self.next_id);
        self.live.insert(id);
        Some(id)
    }

    fn destroy(&mut self, buffer: GpuBufferId) {
        assert!(self.live.remove(&buffer), "destroyed a buffer twice");
    }

    fn upload(
        &mut self,
        buffer: GpuBufferId,
        _pixels: &[u8],
        _pixels_size: IntSize,
        _origin: IntPoint,
    ) {
        assert!(self.live.contains(&buffer), "upload to a dead buffer");
    }
}

/// Thread-shared allocator so tests can inspect buffer lifetimes after the
/// compositor thread exits.
#[derive(Clone, Default)]
struct SharedAllocator {
    inner: Arc<Mutex<RecordingAllocator>>,
}

impl BufferAllocator for SharedAllocator {
    fn allocate(&mut self, size: IntSize, policy: BackingPolicy) -> Option<GpuBufferId> {
        self.inner
            .lock()
            .expect("allocator lock poisoned")
            .allocate(size, policy)
    }

    fn destroy(&mut self, buffer: GpuBufferId) {
        self.inner
            .lock()
            .expect("allocator lock poisoned")
            .destroy(buffer);
    }

    fn upload(
        &mut self,
        buffer: GpuBufferId,
        pixels: &[u8],
        pixels_size: IntSize,
        origin: IntPoint,
    ) {
        self.inner
            .lock()
            .expect("allocator lock poisoned")
            .upload(buffer, pixels, pixels_size, origin);
    }
}

struct ChannelSink {
    sender: crossbeam_channel::Sender<FramePlan>,
}

impl FrameSink for ChannelSink {
    fn present(&mut self, plan: FramePlan) {
        let _ = self.sender.send(plan);
    }
}

const RED: Color = Color {
    red: 255,
    green: 0,
    blue: 0,
    alpha: 255,
};

fn viewport(width: f32, height: f32) -> Viewport {
    Viewport {
        target_rect: Rect::new(0.0, 0.0, width, height),
        clip_rect: Rect::new(0.0, 0.0, width, height),
        visible_rect: Rect::new(0.0, 0.0, width, height),
        layout_rect: Rect::new(0.0, 0.0, width, height),
        contents_size: Size::new(width, height),
        scale: 1.0,
    }
}

fn solid_root() -> Layer {
    let mut root = Layer::new();
    root.set_bounds(Size::new(200.0, 200.0));
    root.position = Point::new(100.0, 100.0);
    root.set_solid_color(RED);
    root
}

/// Drive a blocking commit against a host living on the same test thread.
fn commit_and_pump(producer: &mut SceneProducer, host: &mut CompositingHost, scale: f32) {
    std::thread::scope(|scope| {
        let handle = scope.spawn(|| producer.commit(scale));
        while !handle.is_finished() {
            host.apply_pending_messages();
            std::thread::yield_now();
        }
        handle
            .join()
            .expect("commit thread panicked")
            .expect("commit failed");
    });
}

#[test]
fn commit_blocks_until_the_host_applies_it() {
    let (mut producer, mut host) = scene_pair(solid_root(), 16 * 1024 * 1024);
    let host_reached_apply = Arc::new(AtomicBool::new(false));
    let flag = host_reached_apply.clone();

    let host_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::SeqCst);
        // Spin until the commit arrives; try_recv may run before the
        // producer's send.
        while !host.has_scene() {
            host.apply_pending_messages();
            std::thread::yield_now();
        }
        host
    });

    producer.commit(1.0).expect("commit failed");
    assert!(
        host_reached_apply.load(Ordering::SeqCst),
        "commit returned before the host got around to applying it"
    );
    let host = host_thread.join().expect("host thread panicked");
    assert!(host.has_scene());
}

#[test]
fn frame_renders_the_committed_scene() {
    let (mut producer, mut host) = scene_pair(solid_root(), 16 * 1024 * 1024);
    let mut allocator = RecordingAllocator::default();

    assert!(
        host.render_frame(0.0, &mut allocator).is_none(),
        "no frame before the first commit"
    );

    producer.set_viewport(viewport(200.0, 200.0)).expect("host alive");
    commit_and_pump(&mut producer, &mut host, 1.0);

    let plan = host
        .render_frame(0.0, &mut allocator)
        .expect("committed scene renders");
    assert!(plan
        .ops
        .iter()
        .any(|op| matches!(op, DrawOp::DrawColor { color, .. } if *color == RED)));
}

#[test]
fn queued_commits_apply_in_order_between_frames() {
    let (mut producer, mut host) = scene_pair(solid_root(), 16 * 1024 * 1024);
    let mut allocator = RecordingAllocator::default();
    producer.set_viewport(viewport(200.0, 200.0)).expect("host alive");

    commit_and_pump(&mut producer, &mut host, 1.0);
    producer.root_mut().position = Point::new(60.0, 60.0);
    commit_and_pump(&mut producer, &mut host, 1.0);
    producer.root_mut().position = Point::new(40.0, 40.0);
    commit_and_pump(&mut producer, &mut host, 1.0);

    host.render_frame(0.0, &mut allocator).expect("scene renders");
    let root = host.root.as_ref().expect("scene committed");
    assert!(
        (root.position.x - 40.0).abs() < 1e-6,
        "frame must show the latest committed revision"
    );
}

#[test]
fn animated_scene_keeps_requesting_frames() {
    let mut root = solid_root();
    root.add_animation(KeyframeAnimation::new(
        "fade",
        vec![
            Keyframe {
                offset: 0.0,
                value: AnimationValue::Opacity(0.0),
            },
            Keyframe {
                offset: 1.0,
                value: AnimationValue::Opacity(1.0),
            },
        ],
        2.0,
        Some(1),
    ));

    let (mut producer, mut host) = scene_pair(root, 16 * 1024 * 1024);
    let mut allocator = RecordingAllocator::default();
    producer.set_viewport(viewport(200.0, 200.0)).expect("host alive");
    commit_and_pump(&mut producer, &mut host, 1.0);

    let plan = host
        .render_frame(0.5, &mut allocator)
        .expect("scene renders");
    assert!(plan.needs_another_frame, "mid-animation frame schedules more");

    let plan = host
        .render_frame(5.0, &mut allocator)
        .expect("scene renders");
    assert!(
        !plan.needs_another_frame,
        "finished animation must stop the frame loop"
    );
}

#[test]
fn spawned_compositor_presents_frames_and_releases_on_shutdown() {
    let (mut producer, host) = scene_pair(solid_root(), 16 * 1024 * 1024);
    let allocator = SharedAllocator::default();
    let allocator_probe = allocator.clone();
    let (plan_sender, plan_receiver) = crossbeam_channel::unbounded();

    let thread = CompositorThread::spawn(host, allocator, ChannelSink { sender: plan_sender });

    producer.set_viewport(viewport(200.0, 200.0)).expect("host alive");
    producer.commit(1.0).expect("commit failed");

    let plan = plan_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("compositor never presented a frame");
    assert!(plan
        .ops
        .iter()
        .any(|op| matches!(op, DrawOp::DrawColor { color, .. } if *color == RED)));

    producer.shutdown();
    thread.join();

    let live = allocator_probe
        .inner
        .lock()
        .expect("allocator lock poisoned")
        .live
        .len();
    assert_eq!(live, 0, "shutdown must return every GPU buffer");
}
