//! Playback controller: owns the live sessions and drives them from the
//! host's render tick.
//!
//! All texture work happens here because the tick runs on the consumer
//! thread; the decode threads never touch presentation state. A session
//! that panics inside its tick step is retired instead of taking the host
//! render loop down with it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::thread::ThreadId;

use crate::error::Result;
use crate::events::EventRegistry;
use crate::frame::FrameBuffer;
use crate::media::SourceHandle;
use crate::session::{PlayOptions, PlaybackSession};

/// Opaque handle to a host-owned presentation texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Identifies one playback session for the lifetime of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Presentation primitives the host supplies.
///
/// Thread-affinity rule: these may only be invoked from the render-tick
/// callback context, never from a decode thread. The controller checks
/// this at runtime in debug builds.
pub trait ConsumerThreadOps {
    /// Allocate a texture for a video of the given dimensions.
    fn create_texture(&mut self, width: u32, height: u32) -> TextureId;

    /// Copy a decoded frame into the texture.
    fn upload_texture(&mut self, texture: TextureId, frame: &FrameBuffer);

    /// Present the texture into the display surface (letterboxing and
    /// placement are the host's business).
    fn draw_texture(&mut self, texture: TextureId, width: u32, height: u32);

    /// Release a texture allocated by `create_texture`.
    fn release_texture(&mut self, texture: TextureId);
}

pub struct Controller {
    sessions: Vec<(SessionId, PlaybackSession)>,
    next_id: u64,
    finished: EventRegistry<SessionId>,
    consumer_thread: Option<ThreadId>,
}

impl Controller {
    pub fn new() -> Self {
        log::info!("video playback controller initialized");
        Self {
            sessions: Vec::new(),
            next_id: 0,
            finished: EventRegistry::new(),
            consumer_thread: None,
        }
    }

    /// Open a local file and queue it for playback. The session starts
    /// playing on the next tick, once its texture is initialized.
    pub fn play_file(&mut self, path: impl AsRef<Path>, options: PlayOptions) -> Result<SessionId> {
        self.play_handle(SourceHandle::from_path(path.as_ref()), options)
    }

    /// Like `play_file`, for an already-resolved source (e.g. a temp copy
    /// of a non-file resource).
    pub fn play_handle(&mut self, handle: SourceHandle, options: PlayOptions) -> Result<SessionId> {
        let session = PlaybackSession::open(handle, options)?;
        Ok(self.add_session(session))
    }

    /// Adopt an externally constructed session (alternate decode backends).
    pub fn add_session(&mut self, session: PlaybackSession) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.push((id, session));
        log::info!("video queued, waiting for render thread to initialize its texture");
        id
    }

    /// Subscribe to end-of-stream notifications for non-looping sessions.
    /// Listeners fire on the consumer thread, in registration order, after
    /// the finished session has been retired.
    pub fn on_finished(&mut self, listener: impl FnMut(&SessionId) + 'static) {
        self.finished.subscribe(listener);
    }

    /// Per-tick entry point. Must be called on the single consumer thread,
    /// at least once per displayed frame.
    ///
    /// For each session: initialize its texture and start it if new,
    /// otherwise drain its mailbox into the texture and draw it. Faults are
    /// contained per session; nothing escapes into the host render loop.
    pub fn on_tick(&mut self, ops: &mut dyn ConsumerThreadOps, _dt_secs: f32) {
        self.assert_consumer_thread();

        let mut finished = Vec::new();
        let mut failed = Vec::new();
        for (id, session) in &mut self.sessions {
            let step = catch_unwind(AssertUnwindSafe(|| {
                tick_session(session, ops);
                session.take_finished()
            }));
            match step {
                Ok(true) => finished.push(*id),
                Ok(false) => {}
                Err(_) => {
                    log::error!("session {id:?} panicked during tick, retiring it");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.retire(id, ops);
        }
        for id in finished {
            log::info!("video finished: {id:?}");
            self.retire(id, ops);
            self.finished.emit(&id);
        }
    }

    /// Stop and release one session.
    pub fn stop_session(&mut self, id: SessionId, ops: &mut dyn ConsumerThreadOps) {
        self.assert_consumer_thread();
        self.retire(id, ops);
    }

    /// Stop and release every session.
    pub fn stop_all(&mut self, ops: &mut dyn ConsumerThreadOps) {
        self.assert_consumer_thread();
        let ids: Vec<SessionId> = self.sessions.iter().map(|(id, _)| *id).collect();
        for id in ids {
            self.retire(id, ops);
        }
    }

    pub fn session(&self, id: SessionId) -> Option<&PlaybackSession> {
        self.sessions
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, s)| s)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut PlaybackSession> {
        self.sessions
            .iter_mut()
            .find(|(sid, _)| *sid == id)
            .map(|(_, s)| s)
    }

    /// True if at least one session is initialized and playing.
    pub fn any_playing(&self) -> bool {
        self.sessions.iter().any(|(_, s)| s.is_playing())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn retire(&mut self, id: SessionId, ops: &mut dyn ConsumerThreadOps) {
        let Some(index) = self.sessions.iter().position(|(sid, _)| *sid == id) else {
            return;
        };
        let (_, mut session) = self.sessions.remove(index);
        if let Some(texture) = session.take_texture() {
            ops.release_texture(texture);
        }
        session.close();
    }

    /// Texture setup and consumption must stay on the thread that delivers
    /// render ticks. The first tick pins that thread.
    fn assert_consumer_thread(&mut self) {
        let current = std::thread::current().id();
        match self.consumer_thread {
            None => self.consumer_thread = Some(current),
            Some(expected) => {
                debug_assert_eq!(
                    expected, current,
                    "controller tick invoked from a non-consumer thread"
                );
            }
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// One session's share of a tick: init + play on first sight, then
/// update + draw while playing.
fn tick_session(session: &mut PlaybackSession, ops: &mut dyn ConsumerThreadOps) {
    if !session.is_initialized() {
        match session.init_textures(ops) {
            Ok(()) => {
                if let Err(e) = session.play() {
                    log::error!("failed to start playback: {e}");
                }
            }
            Err(e) => log::error!("failed to initialize video texture: {e}"),
        }
        return;
    }
    if session.is_playing() {
        session.update(ops);
        if let Some(texture) = session.texture() {
            ops.draw_texture(texture, session.width(), session.height());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use crate::error::Result as MediaResult;
    use crate::media::probe::VideoMeta;
    use crate::media::{FrameStatus, VideoSource};
    use crate::session::PlaybackState;

    struct FakeSource {
        meta: VideoMeta,
        total: u64,
        pos: u64,
    }

    impl FakeSource {
        fn new(fps: f64, total: u64) -> Self {
            Self {
                meta: VideoMeta {
                    width: 4,
                    height: 4,
                    fps,
                    duration_secs: total as f64 / fps,
                    has_audio: false,
                },
                total,
                pos: 0,
            }
        }
    }

    impl VideoSource for FakeSource {
        fn meta(&self) -> &VideoMeta {
            &self.meta
        }

        fn next_frame(&mut self, target: &mut FrameBuffer) -> MediaResult<FrameStatus> {
            if self.pos >= self.total {
                return Ok(FrameStatus::EndOfStream);
            }
            target.data.fill(self.pos as u8);
            self.pos += 1;
            Ok(FrameStatus::Frame)
        }

        fn rewind(&mut self) -> MediaResult<()> {
            self.pos = 0;
            Ok(())
        }

        fn position(&self) -> u64 {
            self.pos
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingOps {
        next_texture: u64,
        created: usize,
        released: usize,
        uploads: usize,
        draws: usize,
    }

    impl ConsumerThreadOps for RecordingOps {
        fn create_texture(&mut self, _width: u32, _height: u32) -> TextureId {
            self.next_texture += 1;
            self.created += 1;
            TextureId(self.next_texture)
        }

        fn upload_texture(&mut self, _texture: TextureId, _frame: &FrameBuffer) {
            self.uploads += 1;
        }

        fn draw_texture(&mut self, _texture: TextureId, _width: u32, _height: u32) {
            self.draws += 1;
        }

        fn release_texture(&mut self, _texture: TextureId) {
            self.released += 1;
        }
    }

    fn fake_session(fps: f64, frames: u64) -> PlaybackSession {
        let _ = env_logger::builder().is_test(true).try_init();
        PlaybackSession::with_source(
            Box::new(FakeSource::new(fps, frames)),
            None,
            None,
            PlayOptions::default(),
        )
    }

    #[test]
    fn tick_initializes_then_plays_then_retires_on_finish() {
        let mut controller = Controller::new();
        let mut ops = RecordingOps::default();

        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fired);
        controller.on_finished(move |id| sink.borrow_mut().push(*id));

        let id = controller.add_session(fake_session(500.0, 60));

        // First tick allocates the texture and starts the decode thread.
        controller.on_tick(&mut ops, 0.016);
        assert_eq!(ops.created, 1);
        assert_eq!(
            controller.session(id).map(PlaybackSession::state),
            Some(PlaybackState::Playing)
        );

        // Keep ticking until the finish notification lands.
        let deadline = Instant::now() + Duration::from_secs(10);
        while fired.borrow().is_empty() && Instant::now() < deadline {
            controller.on_tick(&mut ops, 0.016);
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(&*fired.borrow(), &[id]);
        assert!(controller.is_empty(), "finished session must be retired");
        assert_eq!(ops.released, 1);
        assert!(ops.uploads > 0);
        assert!(ops.draws > 0);
    }

    #[test]
    fn finished_listeners_fire_in_order() {
        let mut controller = Controller::new();
        let mut ops = RecordingOps::default();

        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        controller.on_finished(move |_| o.borrow_mut().push("first"));
        let o = Rc::clone(&order);
        controller.on_finished(move |_| o.borrow_mut().push("second"));

        controller.add_session(fake_session(1000.0, 2));
        let deadline = Instant::now() + Duration::from_secs(10);
        while order.borrow().is_empty() && Instant::now() < deadline {
            controller.on_tick(&mut ops, 0.016);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(&*order.borrow(), &["first", "second"]);
    }

    #[test]
    fn stop_all_releases_every_session() {
        let mut controller = Controller::new();
        let mut ops = RecordingOps::default();
        controller.add_session(fake_session(50.0, 1000));
        controller.add_session(fake_session(50.0, 1000));
        controller.on_tick(&mut ops, 0.016);
        assert!(controller.any_playing());

        controller.stop_all(&mut ops);
        assert!(controller.is_empty());
        assert!(!controller.any_playing());
        assert_eq!(ops.released, 2);
    }

    #[test]
    fn unknown_session_id_is_ignored() {
        let mut controller = Controller::new();
        let mut ops = RecordingOps::default();
        let id = controller.add_session(fake_session(50.0, 10));
        controller.stop_session(id, &mut ops);
        // Stopping an already-retired session is a no-op.
        controller.stop_session(id, &mut ops);
        assert!(controller.session(id).is_none());
    }
}
