//! Streaming video decode via ffmpeg subprocess.
//!
//! - one ffmpeg child per open source, writing raw RGBA frames to a pipe
//! - `next_frame` reads exactly width*height*4 bytes per call; the pipe's
//!   backpressure keeps the child roughly one buffer ahead of the reader
//! - rewind kills and respawns the child (rawvideo pipes cannot seek)
//! - only video frames travel the pipe; container audio never enters it

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::error::{MediaError, Result};
use crate::frame::FrameBuffer;
use crate::media::probe::{self, VideoMeta};
use crate::media::{AbortHandle, FrameStatus, PixelLayout, VideoSource};

/// Copy one decoded frame into the target buffer's RGBA8 layout.
///
/// Fast path: raw byte copy when the source is already RGBA8. Slow path:
/// per-channel gather for any other 4-byte layout. Both produce identical
/// bytes for identical input.
pub fn convert_into(src: &[u8], layout: PixelLayout, dst: &mut FrameBuffer) {
    debug_assert_eq!(src.len(), dst.data.len());
    if layout == PixelLayout::RGBA {
        dst.data.copy_from_slice(src);
        return;
    }
    for (dst_px, src_px) in dst.data.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        for (c, &pos) in layout.order.iter().enumerate() {
            dst_px[c] = src_px[pos];
        }
    }
}

fn lock_child(child: &Arc<Mutex<Option<Child>>>) -> std::sync::MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn kill_child(child: &Arc<Mutex<Option<Child>>>) {
    if let Some(mut child) = lock_child(child).take() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Demux+decode source backed by an ffmpeg child process.
#[derive(Debug)]
pub struct FfmpegVideoSource {
    path: PathBuf,
    meta: VideoMeta,
    layout: PixelLayout,
    // Shared so an AbortHandle can kill the child from another thread,
    // which fails any pipe read blocked inside next_frame.
    child: Arc<Mutex<Option<Child>>>,
    stdout: Option<ChildStdout>,
    scratch: Vec<u8>,
    frames_read: u64,
    at_eof: bool,
}

impl FfmpegVideoSource {
    /// Probe the container and start the decoder at frame zero.
    pub fn open(path: &Path) -> Result<Self> {
        let meta = probe::probe_video(path)?;
        let frame_size = meta.width as usize * meta.height as usize * 4;
        let mut source = Self {
            path: path.to_path_buf(),
            meta,
            // ffmpeg is asked for rgba explicitly, so the fast copy path is
            // the norm; the layout stays configurable for other backends.
            layout: PixelLayout::RGBA,
            child: Arc::new(Mutex::new(None)),
            stdout: None,
            scratch: vec![0u8; frame_size],
            frames_read: 0,
            at_eof: false,
        };
        source.spawn_decoder().map_err(|e| MediaError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(source)
    }

    fn spawn_decoder(&mut self) -> anyhow::Result<()> {
        let mut child = Command::new("ffmpeg")
            .args(["-i"])
            .arg(&self.path)
            .args([
                "-f", "rawvideo",
                "-pix_fmt", "rgba",
                "-s", &format!("{}x{}", self.meta.width, self.meta.height),
                "-v", "quiet",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn ffmpeg: {e}"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg: no stdout pipe"))?;

        *lock_child(&self.child) = Some(child);
        self.stdout = Some(stdout);
        self.frames_read = 0;
        self.at_eof = false;
        Ok(())
    }

    /// Kill and reap the child. Unblocks any pipe read in flight.
    fn kill_decoder(&mut self) {
        self.stdout = None;
        kill_child(&self.child);
    }

    /// Fill the scratch buffer with one frame. Ok(true) on a full frame,
    /// Ok(false) on clean end-of-stream, Err on a truncated frame or pipe
    /// failure mid-stream.
    fn read_frame(&mut self) -> Result<bool> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(false);
        };
        let mut filled = 0;
        while filled < self.scratch.len() {
            match stdout.read(&mut self.scratch[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(false);
                    }
                    return Err(MediaError::DecodeFailure(format!(
                        "truncated frame: got {filled} of {} bytes",
                        self.scratch.len()
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(MediaError::DecodeFailure(format!(
                        "decoder pipe read failed: {e}"
                    )));
                }
            }
        }
        Ok(true)
    }
}

impl VideoSource for FfmpegVideoSource {
    fn meta(&self) -> &VideoMeta {
        &self.meta
    }

    fn next_frame(&mut self, target: &mut FrameBuffer) -> Result<FrameStatus> {
        if self.at_eof {
            return Ok(FrameStatus::EndOfStream);
        }
        if self.read_frame()? {
            convert_into(&self.scratch, self.layout, target);
            self.frames_read += 1;
            Ok(FrameStatus::Frame)
        } else {
            self.at_eof = true;
            log::debug!("decoder reached end of stream after {} frames", self.frames_read);
            Ok(FrameStatus::EndOfStream)
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.kill_decoder();
        self.spawn_decoder()
            .map_err(|e| MediaError::SeekFailed(format!("decoder restart failed: {e}")))
    }

    fn position(&self) -> u64 {
        self.frames_read
    }

    fn close(&mut self) {
        self.kill_decoder();
        self.at_eof = true;
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let child = Arc::clone(&self.child);
        Some(AbortHandle::new(move || kill_child(&child)))
    }
}

impl Drop for FfmpegVideoSource {
    fn drop(&mut self) {
        self.close();
    }
}
