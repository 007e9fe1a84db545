//! Two-thread scene compositing.
//!
//! The UI thread owns a [`SceneProducer`] and mutates its layer tree
//! freely; [`SceneProducer::commit`] snapshots the tree and blocks until
//! the compositing thread's [`CompositingHost`] has applied it. The host
//! only applies commits between frames, so a frame always renders one
//! consistent tree revision.

use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use layer_tree::{Layer, LayerSnapshot};
use renderer::{CommittedLayer, FramePlan, Renderer, Viewport};
use texture_cache::{BufferAllocator, TextureCache};

#[cfg(test)]
mod tests;

#[derive(Debug)]
pub enum CommitError {
    /// The compositing thread is gone; the scene can no longer be shown.
    HostDisconnected,
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitError::HostDisconnected => {
                formatter.write_str("compositing host disconnected")
            }
        }
    }
}

impl std::error::Error for CommitError {}

enum HostMessage {
    Commit(LayerSnapshot),
    SetViewport(Viewport),
    SetDebugBorders(bool),
    Shutdown,
}

/// UI-thread half. Owns the mutable layer tree and the commit channel.
pub struct SceneProducer {
    root: Layer,
    message_sender: Sender<HostMessage>,
    ack_receiver: Receiver<()>,
}

impl SceneProducer {
    pub fn root(&self) -> &Layer {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Layer {
        &mut self.root
    }

    /// Paint dirty content, snapshot the tree, and hand it to the host.
    /// Blocks until the host has applied the snapshot, which is what
    /// makes a commit atomic with respect to frames: when this returns,
    /// the next rendered frame shows exactly this revision.
    pub fn commit(&mut self, scale: f32) -> Result<(), CommitError> {
        self.root.update_contents(scale);
        let snapshot = self.root.commit_snapshot();
        self.message_sender
            .send(HostMessage::Commit(snapshot))
            .map_err(|_| CommitError::HostDisconnected)?;
        self.ack_receiver
            .recv()
            .map_err(|_| CommitError::HostDisconnected)
    }

    pub fn set_viewport(&self, viewport: Viewport) -> Result<(), CommitError> {
        self.message_sender
            .send(HostMessage::SetViewport(viewport))
            .map_err(|_| CommitError::HostDisconnected)
    }

    pub fn set_debug_borders(&self, enabled: bool) -> Result<(), CommitError> {
        self.message_sender
            .send(HostMessage::SetDebugBorders(enabled))
            .map_err(|_| CommitError::HostDisconnected)
    }

    pub fn shutdown(&self) {
        // The host may already be gone; either way it stops.
        let _ = self.message_sender.send(HostMessage::Shutdown);
    }
}

/// Compositing-thread half. Owns the committed tree and the renderer.
pub struct CompositingHost {
    renderer: Renderer,
    root: Option<CommittedLayer>,
    message_receiver: Receiver<HostMessage>,
    ack_sender: Sender<()>,
    epoch: Instant,
    shutdown_requested: bool,
}

/// Build a connected producer/host pair. The commit channel is bounded at
/// one snapshot: a producer that outruns the host parks on its own send.
pub fn scene_pair(root: Layer, budget_bytes: usize) -> (SceneProducer, CompositingHost) {
    let (message_sender, message_receiver) = bounded(1);
    let (ack_sender, ack_receiver) = bounded(0);
    let producer = SceneProducer {
        root,
        message_sender,
        ack_receiver,
    };
    let host = CompositingHost {
        renderer: Renderer::new(TextureCache::new(budget_bytes)),
        root: None,
        message_receiver,
        ack_sender,
        epoch: Instant::now(),
        shutdown_requested: false,
    };
    (producer, host)
}

impl CompositingHost {
    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    pub fn has_scene(&self) -> bool {
        self.root.is_some()
    }

    /// Drain and apply every queued message. Must only run between
    /// frames; each applied commit is acknowledged so the blocked
    /// producer resumes.
    pub fn apply_pending_messages(&mut self) {
        loop {
            match self.message_receiver.try_recv() {
                Ok(message) => self.apply_message(message),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown_requested = true;
                    return;
                }
            }
        }
    }

    fn apply_message(&mut self, message: HostMessage) {
        match message {
            HostMessage::Commit(snapshot) => {
                match &mut self.root {
                    Some(root) => root.apply_snapshot(snapshot, self.renderer.cache_mut()),
                    None => self.root = Some(CommittedLayer::from_snapshot(snapshot)),
                }
                if self.ack_sender.send(()).is_err() {
                    log::warn!("commit acknowledged into a disconnected producer");
                }
            }
            HostMessage::SetViewport(viewport) => self.renderer.set_viewport(viewport),
            HostMessage::SetDebugBorders(enabled) => self.renderer.set_debug_borders(enabled),
            HostMessage::Shutdown => self.shutdown_requested = true,
        }
    }

    /// Run one frame: apply queued commits, then the three planning
    /// phases. Returns `None` while no scene has been committed.
    pub fn render_frame(
        &mut self,
        now: f64,
        allocator: &mut dyn BufferAllocator,
    ) -> Option<FramePlan> {
        self.apply_pending_messages();
        let root = self.root.as_mut()?;

        let animating = self.renderer.prepare_frame(root, now, allocator);
        self.renderer.update_layers(root);
        let mut plan = self.renderer.composite_layers(root, allocator);
        plan.needs_another_frame |= animating;

        // Deferred eviction settles after the frame: destroy released
        // buffers and push the cache back under budget.
        let budget = self.renderer.cache().budget_bytes();
        self.renderer.cache_mut().prune(budget);
        self.renderer.cache_mut().collect_garbage(allocator);
        Some(plan)
    }

    /// Tear the scene down and give every GPU buffer back.
    pub fn release(&mut self, allocator: &mut dyn BufferAllocator) {
        if let Some(mut root) = self.root.take() {
            root.release_resources(self.renderer.cache_mut());
        }
        self.renderer.cache_mut().collect_garbage(allocator);
    }

    /// Host main loop: block for messages while idle, render while the
    /// scene keeps asking for frames.
    pub fn run(&mut self, allocator: &mut dyn BufferAllocator, sink: &mut dyn FrameSink) {
        let mut needs_frame = false;
        loop {
            if needs_frame {
                self.apply_pending_messages();
            } else {
                match self.message_receiver.recv() {
                    Ok(message) => self.apply_message(message),
                    Err(_) => self.shutdown_requested = true,
                }
                self.apply_pending_messages();
                needs_frame = true;
            }
            if self.shutdown_requested {
                self.release(allocator);
                return;
            }

            let now = self.epoch.elapsed().as_secs_f64();
            match self.render_frame(now, allocator) {
                Some(plan) => {
                    needs_frame = plan.needs_another_frame;
                    sink.present(plan);
                }
                None => needs_frame = false,
            }
            if self.shutdown_requested {
                self.release(allocator);
                return;
            }
        }
    }
}

/// Where finished frame plans go: the GPU executor in production, a
/// recording stub in tests.
pub trait FrameSink: Send {
    fn present(&mut self, plan: FramePlan);
}

/// Owning handle for a spawned compositing thread.
pub struct CompositorThread {
    join_handle: Option<JoinHandle<()>>,
}

impl CompositorThread {
    pub fn spawn<A, S>(mut host: CompositingHost, mut allocator: A, mut sink: S) -> Self
    where
        A: BufferAllocator + Send + 'static,
        S: FrameSink + 'static,
    {
        let join_handle = std::thread::Builder::new()
            .name("compositor".into())
            .spawn(move || host.run(&mut allocator, &mut sink))
            .expect("failed to spawn the compositor thread");
        Self {
            join_handle: Some(join_handle),
        }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                log::error!("compositor thread panicked");
            }
        }
    }
}

impl Drop for CompositorThread {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}
