//! One video playback session: decode thread, buffer pair, audio, lifecycle.
//!
//! Threading model: one producer (decode) thread per playing session plus
//! the host's consumer thread. The only state they share is the mailbox and
//! a handful of atomics; the media source is owned by whichever side is
//! active (moved into the decode thread on play, returned on exit).
//!
//! Stopping is advisory-then-forced: clear the playing flag, wait a bounded
//! time for the thread to exit, then interrupt the decoder (kills the
//! ffmpeg child so a blocked pipe read fails) and finally abandon the
//! thread if it still will not die.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::audio::{AudioHandle, AudioTrack};
use crate::controller::{ConsumerThreadOps, TextureId};
use crate::error::{MediaError, Result};
use crate::frame::{FrameBuffer, Mailbox};
use crate::media::decode::FfmpegVideoSource;
use crate::media::probe::VideoMeta;
use crate::media::{AbortHandle, FrameStatus, SourceHandle, VideoSource};
use crate::pacing::Pacer;

/// Bounded wait for the decode thread after clearing the playing flag.
const JOIN_WAIT: Duration = Duration::from_secs(1);
/// Additional wait after interrupting the decoder.
const ABORT_WAIT: Duration = Duration::from_millis(250);
/// Upper bound on one pacing sleep, so a stop request is observed promptly
/// even when the frame interval rivals `JOIN_WAIT` (low-fps sources).
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Idle = 0,
    Loading,
    Ready,
    Playing,
    Paused,
    Stopped,
    Finished,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Loading,
            2 => Self::Ready,
            3 => Self::Playing,
            4 => Self::Paused,
            5 => Self::Stopped,
            6 => Self::Finished,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlayOptions {
    pub looping: bool,
    pub volume: f32,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            looping: false,
            volume: 1.0,
        }
    }
}

/// State shared between the decode thread and the session handle.
struct SharedState {
    mailbox: Mailbox,
    playing: AtomicBool,
    looping: AtomicBool,
    state: AtomicU8,
    finished: AtomicBool,
    catching_up: AtomicBool,
    frames_decoded: AtomicU64,
}

impl SharedState {
    fn new(looping: bool) -> Self {
        Self {
            mailbox: Mailbox::new(),
            playing: AtomicBool::new(false),
            looping: AtomicBool::new(looping),
            state: AtomicU8::new(PlaybackState::Loading as u8),
            finished: AtomicBool::new(false),
            catching_up: AtomicBool::new(false),
            frames_decoded: AtomicU64::new(0),
        }
    }

    fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Everything the decode thread takes exclusive ownership of while playing.
struct DecodeCore {
    source: Box<dyn VideoSource>,
    write_buf: Option<Box<FrameBuffer>>,
    spare_buf: Option<Box<FrameBuffer>>,
}

impl DecodeCore {
    fn give_back(&mut self, buf: Box<FrameBuffer>) {
        if self.write_buf.is_none() {
            self.write_buf = Some(buf);
        } else {
            self.spare_buf = Some(buf);
        }
    }
}

pub struct PlaybackSession {
    meta: VideoMeta,
    shared: Arc<SharedState>,
    core: Option<DecodeCore>,
    core_rx: Option<Receiver<DecodeCore>>,
    abort: Option<AbortHandle>,
    audio: Option<AudioTrack>,
    source_handle: Option<SourceHandle>,
    thread: Option<JoinHandle<()>>,
    texture: Option<TextureId>,
    last_uploaded_seq: u64,
}

impl PlaybackSession {
    /// Open a resolved media file: probe + start the video decoder, and
    /// prepare the audio track if the container has one. Audio failure is
    /// non-fatal (the session continues with silent video); video failure
    /// aborts session creation.
    pub fn open(handle: SourceHandle, options: PlayOptions) -> Result<Self> {
        log::info!("loading video from: {}", handle.path().display());
        let source = FfmpegVideoSource::open(handle.path())?;

        let audio = if source.meta().has_audio {
            match AudioTrack::prepare(handle.path()) {
                Ok(mut track) => {
                    track.set_volume(options.volume);
                    Some(track)
                }
                Err(e) => {
                    log::warn!("audio unavailable, continuing with silent video: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self::with_source(Box::new(source), audio, Some(handle), options))
    }

    /// Build a session around an already-opened source. Used for alternate
    /// decode backends.
    pub fn with_source(
        source: Box<dyn VideoSource>,
        audio: Option<AudioTrack>,
        source_handle: Option<SourceHandle>,
        options: PlayOptions,
    ) -> Self {
        let meta = source.meta().clone();
        log::info!(
            "video loaded: {}x{}, {:.2} fps, frame time {:?}",
            meta.width,
            meta.height,
            meta.fps,
            meta.frame_duration()
        );
        let abort = source.abort_handle();
        Self {
            meta,
            shared: Arc::new(SharedState::new(options.looping)),
            core: Some(DecodeCore {
                source,
                write_buf: None,
                spare_buf: None,
            }),
            core_rx: None,
            abort,
            audio,
            source_handle,
            thread: None,
            texture: None,
            last_uploaded_seq: 0,
        }
    }

    /// Allocate the presentation texture and the frame-buffer pair. Must be
    /// called from the consumer (render) thread before `play`; the
    /// controller enforces that by only calling this from the tick.
    pub fn init_textures(&mut self, ops: &mut dyn ConsumerThreadOps) -> Result<()> {
        if self.texture.is_some() {
            return Ok(());
        }
        let Some(core) = self.core.as_mut() else {
            return Err(MediaError::DecodeFailure("session is closed".into()));
        };
        let (w, h) = (self.meta.width, self.meta.height);
        self.texture = Some(ops.create_texture(w, h));
        core.write_buf = Some(Box::new(FrameBuffer::new(w, h)));
        core.spare_buf = Some(Box::new(FrameBuffer::new(w, h)));
        self.shared.set_state(PlaybackState::Ready);
        log::info!("video texture initialized: {}x{}", w, h);
        Ok(())
    }

    /// Start (or restart) playback. No-op if a decode thread is already
    /// live. Records a fresh pacing base, starts audio, and spawns the
    /// decode thread.
    pub fn play(&mut self) -> Result<()> {
        if let Some(thread) = &self.thread {
            if !thread.is_finished() {
                return Ok(());
            }
        }
        self.join_decoder();

        let state = self.shared.state();
        if !matches!(
            state,
            PlaybackState::Ready
                | PlaybackState::Paused
                | PlaybackState::Stopped
                | PlaybackState::Finished
        ) {
            return Err(MediaError::DecodeFailure(format!(
                "cannot start playback from state {state:?} (texture not initialized?)"
            )));
        }
        let Some(core) = self.core.take() else {
            return Err(MediaError::DecodeFailure(
                "decoder unavailable (previous decode thread was abandoned)".into(),
            ));
        };

        self.shared.finished.store(false, Ordering::Release);
        self.shared.catching_up.store(false, Ordering::Release);
        self.shared.frames_decoded.store(0, Ordering::Release);
        self.last_uploaded_seq = 0;
        self.shared.playing.store(true, Ordering::Release);
        self.shared.set_state(PlaybackState::Playing);

        if let Some(audio) = &self.audio {
            audio.play();
        }

        let shared = Arc::clone(&self.shared);
        let audio_handle = self.audio.as_ref().and_then(AudioTrack::handle);
        let (core_tx, core_rx) = crossbeam_channel::bounded(1);
        self.core_rx = Some(core_rx);

        let spawned = std::thread::Builder::new()
            .name("video-decode".into())
            .spawn(move || decode_thread(core, &shared, audio_handle.as_ref(), &core_tx));
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                log::info!("video playback started");
                Ok(())
            }
            Err(e) => {
                self.shared.playing.store(false, Ordering::Release);
                self.shared.set_state(PlaybackState::Stopped);
                if let Some(audio) = &self.audio {
                    audio.stop();
                }
                Err(MediaError::DecodeFailure(format!(
                    "failed to spawn decode thread: {e}"
                )))
            }
        }
    }

    /// Pause playback: stop the decode thread, keep positions.
    pub fn pause(&mut self) {
        self.shared.playing.store(false, Ordering::Release);
        if let Some(audio) = &self.audio {
            audio.pause();
        }
        self.join_decoder();
        if self.shared.state() == PlaybackState::Playing {
            self.shared.set_state(PlaybackState::Paused);
        }
    }

    /// Stop playback: like pause, but also rewinds the source and audio to
    /// the start and clears the published frame.
    pub fn stop(&mut self) {
        self.shared.playing.store(false, Ordering::Release);
        if let Some(audio) = &self.audio {
            audio.stop();
        }
        self.join_decoder();
        match self.core.as_mut() {
            Some(core) => {
                if let Err(e) = core.source.rewind() {
                    log::warn!("rewind during stop failed: {e}");
                }
                if let Some(buf) = self.shared.mailbox.take() {
                    core.give_back(buf);
                }
            }
            None => {
                let _ = self.shared.mailbox.take();
            }
        }
        match self.shared.state() {
            PlaybackState::Idle | PlaybackState::Loading => {}
            _ => self.shared.set_state(PlaybackState::Stopped),
        }
    }

    /// Release everything: decode state, audio, frame buffers, temp input
    /// copy. Idempotent. The presentation texture is released separately by
    /// the controller (it needs the consumer thread).
    pub fn close(&mut self) {
        self.stop();
        if let Some(mut audio) = self.audio.take() {
            audio.cleanup();
        }
        if let Some(mut core) = self.core.take() {
            core.source.close();
        }
        self.core_rx = None;
        let _ = self.shared.mailbox.take();
        if let Some(mut handle) = self.source_handle.take() {
            handle.cleanup();
        }
        self.shared.set_state(PlaybackState::Idle);
    }

    /// Consumer-side per-tick step: peek the mailbox and upload the frame
    /// to the presentation texture if it changed since the last upload.
    pub fn update(&mut self, ops: &mut dyn ConsumerThreadOps) {
        if !self.is_playing() {
            return;
        }
        let Some(texture) = self.texture else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let last = self.last_uploaded_seq;
        let uploaded = shared.mailbox.peek_with(|frame| {
            if frame.seq == last {
                return last;
            }
            ops.upload_texture(texture, frame);
            frame.seq
        });
        if let Some(seq) = uploaded {
            self.last_uploaded_seq = seq;
        }
    }

    pub fn meta(&self) -> &VideoMeta {
        &self.meta
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.texture.is_some()
    }

    /// Handle of the current presentation texture, if initialized.
    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    pub(crate) fn take_texture(&mut self) -> Option<TextureId> {
        self.texture.take()
    }

    /// True while the decode loop is behind its wall-clock schedule.
    pub fn catching_up(&self) -> bool {
        self.shared.catching_up.load(Ordering::Acquire)
    }

    /// Frames decoded since the last `play`.
    pub fn frames_decoded(&self) -> u64 {
        self.shared.frames_decoded.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
    }

    pub fn looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn set_volume(&mut self, volume: f32) {
        if let Some(audio) = &mut self.audio {
            audio.set_volume(volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.audio.as_ref().map_or(0.0, AudioTrack::volume)
    }

    /// Latched end-of-stream signal; returns true exactly once per finish.
    pub fn take_finished(&self) -> bool {
        self.shared.finished.swap(false, Ordering::AcqRel)
    }

    /// Bounded join, then forced interruption, then abandonment. Recovers
    /// the decode core from the thread when it exits cleanly.
    fn join_decoder(&mut self) {
        if let Some(handle) = self.thread.take() {
            if !wait_finished(&handle, JOIN_WAIT) {
                log::warn!("decode thread did not stop in time, interrupting decoder");
                if let Some(abort) = &self.abort {
                    abort.abort();
                }
                if !wait_finished(&handle, ABORT_WAIT) {
                    log::warn!("decode thread still running, abandoning it");
                    self.recover_core();
                    return;
                }
            }
            let _ = handle.join();
        }
        self.recover_core();
    }

    fn recover_core(&mut self) {
        if self.core.is_some() {
            return;
        }
        if let Some(rx) = &self.core_rx {
            if let Ok(core) = rx.try_recv() {
                self.core = Some(core);
            }
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

/// Decode thread entry: contains panics, always hands the core back.
fn decode_thread(
    mut core: DecodeCore,
    shared: &Arc<SharedState>,
    audio: Option<&AudioHandle>,
    core_tx: &crossbeam_channel::Sender<DecodeCore>,
) {
    log::debug!("decode thread started");
    let frame_duration = core.source.meta().frame_duration();
    let result = catch_unwind(AssertUnwindSafe(|| {
        decode_loop(&mut core, shared, audio, frame_duration);
    }));
    if result.is_err() {
        log::error!("decode thread panicked");
        shared.playing.store(false, Ordering::Release);
        shared.set_state(PlaybackState::Stopped);
    }
    let _ = core_tx.send(core);
    log::debug!("decode thread stopped");
}

/// Producer loop: pace against the wall clock, decode into the buffer that
/// is not currently published, publish, repeat. Never blocks on the
/// consumer.
fn decode_loop(
    core: &mut DecodeCore,
    shared: &SharedState,
    audio: Option<&AudioHandle>,
    frame_duration: Duration,
) {
    let mut pacer = Pacer::new(frame_duration);
    let mut frames_this_pass: u64 = 0;

    while shared.playing.load(Ordering::Acquire) {
        // Sleep in bounded slices, re-checking the playing flag each time.
        while let Some(delay) = pacer.pre_frame(Instant::now()) {
            std::thread::sleep(delay.min(SLEEP_SLICE));
            if !shared.playing.load(Ordering::Acquire) {
                return;
            }
        }
        shared
            .catching_up
            .store(pacer.catching_up(), Ordering::Release);

        let Some(mut target) = core.write_buf.take() else {
            log::error!("decode loop lost its write buffer");
            shared.playing.store(false, Ordering::Release);
            shared.set_state(PlaybackState::Stopped);
            break;
        };

        match core.source.next_frame(&mut target) {
            Ok(FrameStatus::Frame) => {
                target.seq = shared.frames_decoded.fetch_add(1, Ordering::AcqRel) + 1;
                frames_this_pass += 1;
                // The buffer we get back is no longer published and becomes
                // the next decode target; on the first publish, fall back to
                // the spare of the pair.
                core.write_buf = shared
                    .mailbox
                    .publish(target)
                    .or_else(|| core.spare_buf.take());
                pacer.frame_done(Instant::now());
                shared
                    .catching_up
                    .store(pacer.catching_up(), Ordering::Release);
            }
            Ok(FrameStatus::EndOfStream) => {
                core.write_buf = Some(target);
                if shared.looping.load(Ordering::Acquire) {
                    if frames_this_pass == 0 {
                        // Rewinding a source that yields no frames would
                        // respawn the decoder in a tight loop.
                        log::error!("source yielded no frames, finishing instead of looping");
                    } else {
                        match core.source.rewind() {
                            Ok(()) => {
                                // Loop around: restart audio from the top and
                                // reset the pacing clock so there is no drift.
                                if let Some(audio) = audio {
                                    audio.stop();
                                    audio.play();
                                }
                                pacer.rewind(Instant::now());
                                frames_this_pass = 0;
                                continue;
                            }
                            Err(e) => {
                                log::error!("loop rewind failed, finishing playback: {e}");
                            }
                        }
                    }
                }
                shared.playing.store(false, Ordering::Release);
                if let Some(audio) = audio {
                    audio.stop();
                }
                shared.set_state(PlaybackState::Finished);
                shared.finished.store(true, Ordering::Release);
                break;
            }
            Err(e) => {
                core.write_buf = Some(target);
                log::error!("decode loop terminating on error: {e}");
                shared.playing.store(false, Ordering::Release);
                shared.set_state(PlaybackState::Stopped);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_meta(fps: f64, frames: u64) -> VideoMeta {
        VideoMeta {
            width: 4,
            height: 4,
            fps,
            duration_secs: frames as f64 / fps,
            has_audio: false,
        }
    }

    /// Synthetic source: `total` frames per pass, each filled with its
    /// frame index.
    struct FakeSource {
        meta: VideoMeta,
        total: u64,
        pos: u64,
        served: u64,
        fail_after: Option<u64>,
        closed: bool,
        closes: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn new(fps: f64, total: u64) -> Self {
            Self {
                meta: test_meta(fps, total),
                total,
                pos: 0,
                served: 0,
                fail_after: None,
                closed: false,
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl VideoSource for FakeSource {
        fn meta(&self) -> &VideoMeta {
            &self.meta
        }

        fn next_frame(&mut self, target: &mut FrameBuffer) -> Result<FrameStatus> {
            if let Some(n) = self.fail_after {
                if self.served >= n {
                    return Err(MediaError::DecodeFailure("synthetic mid-stream error".into()));
                }
            }
            if self.pos >= self.total {
                return Ok(FrameStatus::EndOfStream);
            }
            target.data.fill(self.pos as u8);
            self.pos += 1;
            self.served += 1;
            Ok(FrameStatus::Frame)
        }

        fn rewind(&mut self) -> Result<()> {
            self.pos = 0;
            Ok(())
        }

        fn position(&self) -> u64 {
            self.pos
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Source whose decode call blocks until its interrupt handle fires,
    /// standing in for a decoder stuck in a pipe read.
    struct BlockingSource {
        meta: VideoMeta,
        gate: crossbeam_channel::Receiver<()>,
        abort_tx: crossbeam_channel::Sender<()>,
        aborted: Arc<AtomicBool>,
    }

    impl BlockingSource {
        fn new() -> Self {
            let (abort_tx, gate) = crossbeam_channel::unbounded();
            Self {
                meta: test_meta(30.0, 10),
                gate,
                abort_tx,
                aborted: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl VideoSource for BlockingSource {
        fn meta(&self) -> &VideoMeta {
            &self.meta
        }

        fn next_frame(&mut self, target: &mut FrameBuffer) -> Result<FrameStatus> {
            let _ = self.gate.recv();
            target.data.fill(0);
            Ok(FrameStatus::Frame)
        }

        fn rewind(&mut self) -> Result<()> {
            Ok(())
        }

        fn position(&self) -> u64 {
            0
        }

        fn close(&mut self) {}

        fn abort_handle(&self) -> Option<AbortHandle> {
            let tx = self.abort_tx.clone();
            let aborted = Arc::clone(&self.aborted);
            Some(AbortHandle::new(move || {
                aborted.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            }))
        }
    }

    #[derive(Default)]
    struct RecordingOps {
        next_texture: u64,
        created: Vec<TextureId>,
        released: Vec<TextureId>,
        uploads: Vec<u64>,
    }

    impl ConsumerThreadOps for RecordingOps {
        fn create_texture(&mut self, _width: u32, _height: u32) -> TextureId {
            self.next_texture += 1;
            let id = TextureId(self.next_texture);
            self.created.push(id);
            id
        }

        fn upload_texture(&mut self, _texture: TextureId, frame: &FrameBuffer) {
            self.uploads.push(frame.seq);
        }

        fn draw_texture(&mut self, _texture: TextureId, _width: u32, _height: u32) {}

        fn release_texture(&mut self, texture: TextureId) {
            self.released.push(texture);
        }
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    fn make_session(fps: f64, frames: u64, looping: bool) -> (PlaybackSession, Arc<AtomicUsize>) {
        init_logs();
        let source = FakeSource::new(fps, frames);
        let closes = Arc::clone(&source.closes);
        let session = PlaybackSession::with_source(
            Box::new(source),
            None,
            None,
            PlayOptions {
                looping,
                volume: 1.0,
            },
        );
        (session, closes)
    }

    #[test]
    fn play_requires_texture_init() {
        let (mut session, _) = make_session(30.0, 10, false);
        assert_eq!(session.state(), PlaybackState::Loading);
        assert!(session.play().is_err());
        assert!(!session.is_playing());
    }

    #[test]
    fn plays_to_finish_and_signals_exactly_once() {
        let (mut session, _) = make_session(500.0, 60, false);
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        assert_eq!(session.state(), PlaybackState::Ready);
        session.play().unwrap();

        // Drive the consumer side while the producer runs.
        let done = wait_until(Duration::from_secs(10), || {
            session.update(&mut ops);
            session.state() == PlaybackState::Finished
        });
        assert!(done, "session never finished");

        assert_eq!(session.frames_decoded(), 60);
        assert!(!session.is_playing());
        assert!(session.take_finished());
        assert!(!session.take_finished(), "finish must latch exactly once");
        // The freshest frame is the last one decoded.
        assert_eq!(session.shared.mailbox.peek_with(|f| f.seq), Some(60));
        assert!(!ops.uploads.is_empty());
    }

    #[test]
    fn looping_rewinds_source_without_skipping() {
        let (mut session, _) = make_session(500.0, 3, true);
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();

        assert!(wait_until(Duration::from_secs(10), || {
            session.frames_decoded() >= 7
        }));
        session.pause();
        assert_eq!(session.state(), PlaybackState::Paused);

        // Thread is joined, so these reads are consistent: the source
        // position is the total frame count modulo the loop length.
        let total = session.frames_decoded();
        let pos = session.core.as_ref().unwrap().source.position();
        assert_eq!(pos, total % 3);
        assert!(!session.take_finished(), "looping session never finishes");
    }

    #[test]
    fn play_while_playing_is_a_noop() {
        let (mut session, _) = make_session(50.0, 1000, false);
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            session.frames_decoded() >= 2
        }));
        let before = session.frames_decoded();
        session.play().unwrap();
        // A restart would have reset the counter.
        assert!(session.frames_decoded() >= before);
        session.pause();
    }

    #[test]
    fn stop_rewinds_and_clears_the_mailbox() {
        let (mut session, _) = make_session(500.0, 1000, false);
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            session.frames_decoded() >= 3
        }));

        session.stop();
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert!(session.shared.mailbox.is_empty());
        assert_eq!(session.core.as_ref().unwrap().source.position(), 0);

        // Replay from the top works after a stop.
        session.play().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            session.frames_decoded() >= 1
        }));
        session.pause();
    }

    #[test]
    fn decode_error_stops_only_the_loop() {
        let source = {
            let mut s = FakeSource::new(500.0, 1000);
            s.fail_after = Some(5);
            s
        };
        let mut session =
            PlaybackSession::with_source(Box::new(source), None, None, PlayOptions::default());
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();

        assert!(wait_until(Duration::from_secs(5), || !session.is_playing()));
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert_eq!(session.frames_decoded(), 5);
        // A decode failure is not a finish.
        assert!(!session.take_finished());
    }

    #[test]
    fn pause_escalates_to_interrupt_a_stuck_decoder() {
        init_logs();
        let source = BlockingSource::new();
        let aborted = Arc::clone(&source.aborted);
        let mut session =
            PlaybackSession::with_source(Box::new(source), None, None, PlayOptions::default());
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();
        // Give the decode thread time to reach the blocking read.
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        session.pause();
        let elapsed = started.elapsed();

        assert!(aborted.load(Ordering::SeqCst), "interrupt must have fired");
        assert!(
            elapsed >= Duration::from_millis(900),
            "interrupt comes only after the bounded join, got {elapsed:?}"
        );
        assert!(
            elapsed < JOIN_WAIT + ABORT_WAIT + Duration::from_secs(1),
            "pause must return within the bounded window, got {elapsed:?}"
        );
        assert!(!session.is_playing());
        // The unblocked thread exited cleanly and handed the decoder back.
        assert!(session.core.is_some());
    }

    #[test]
    fn pause_is_prompt_for_low_fps_sources() {
        let (mut session, _) = make_session(1.0, 10, false);
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();
        // The first frame decodes immediately; the loop then sleeps toward
        // a target a full second away.
        assert!(wait_until(Duration::from_secs(2), || {
            session.frames_decoded() >= 1
        }));

        let started = Instant::now();
        session.pause();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "pause must not wait out the frame interval"
        );
        assert_eq!(session.state(), PlaybackState::Paused);
        // The decoder was not killed: position is intact, nothing finished.
        let decoded = session.frames_decoded();
        assert_eq!(session.core.as_ref().unwrap().source.position(), decoded);
        assert!(!session.take_finished());
    }

    #[test]
    fn looping_restarts_audio_with_the_stream() {
        init_logs();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..800i16 {
            writer.write_sample(i % 64).unwrap();
        }
        writer.finalize().unwrap();
        let audio = AudioTrack::prepare(&path).unwrap();

        let mut session = PlaybackSession::with_source(
            Box::new(FakeSource::new(500.0, 3)),
            Some(audio),
            None,
            PlayOptions {
                looping: true,
                volume: 1.0,
            },
        );
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();

        // At least two loop-arounds, each restarting the audio track.
        assert!(wait_until(Duration::from_secs(10), || {
            session.frames_decoded() >= 9
        }));
        session.pause();
        assert!(session.has_audio());
        assert!(!session.take_finished());
        session.close();
    }

    #[test]
    fn zero_frame_looping_source_finishes() {
        let (mut session, _) = make_session(30.0, 0, true);
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();

        // Without a decoded frame there is nothing to loop over; the
        // session must finish rather than rewind forever.
        assert!(wait_until(Duration::from_secs(5), || {
            session.state() == PlaybackState::Finished
        }));
        assert_eq!(session.frames_decoded(), 0);
        assert!(session.take_finished());
    }

    #[test]
    fn close_is_idempotent() {
        let (mut session, closes) = make_session(500.0, 10, false);
        let mut ops = RecordingOps::default();
        session.init_textures(&mut ops).unwrap();
        session.play().unwrap();
        session.close();
        session.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), PlaybackState::Idle);
    }

    #[test]
    fn hundred_sessions_close_without_leaks() {
        let mut counters = Vec::new();
        for _ in 0..100 {
            let (mut session, closes) = make_session(30.0, 10, false);
            counters.push(closes);
            session.close();
        }
        for closes in counters {
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }
    }
}
