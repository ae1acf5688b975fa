//! Media sources: probing, streaming decode, and resolution to local files.

pub mod decode;
pub mod probe;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::error::{MediaError, Result};
use crate::frame::FrameBuffer;
use probe::VideoMeta;

/// Outcome of pulling one frame from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Frame,
    EndOfStream,
}

/// Sequential access to decoded video frames of one opened container.
///
/// Owned exclusively by one playback session; only the decode thread calls
/// `next_frame`. Rewind-to-start is supported, arbitrary seek is not.
pub trait VideoSource: Send {
    fn meta(&self) -> &VideoMeta;

    /// Decode the next video frame into `target` (audio frames in the same
    /// container are skipped by this accessor).
    fn next_frame(&mut self, target: &mut FrameBuffer) -> Result<FrameStatus>;

    /// Reset decode position to the first frame.
    fn rewind(&mut self) -> Result<()>;

    /// Frame index of the next frame to decode (0 after open or rewind).
    fn position(&self) -> u64;

    /// Release native decode state. Idempotent.
    fn close(&mut self);

    /// A handle that can interrupt a blocked `next_frame` from another
    /// thread (used as the forced-cancellation escalation when a decode
    /// thread ignores its stop flag). Sources that never block may return
    /// `None`.
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

/// Cross-thread interrupt for a blocked decode call.
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn abort(&self) {
        (self.0)();
    }
}

/// Byte positions of the R, G, B, A channels within one 4-byte source pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    pub order: [usize; 4],
}

impl PixelLayout {
    pub const RGBA: Self = Self { order: [0, 1, 2, 3] };
    pub const BGRA: Self = Self { order: [2, 1, 0, 3] };
}

/// A resolved local media file, plus ownership of its temp copy if the
/// source was not already a file on disk.
pub struct SourceHandle {
    path: PathBuf,
    temp: Option<NamedTempFile>,
}

impl SourceHandle {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            temp: None,
        }
    }

    /// Copy an opaque resource stream to a temp file so the decoder gets a
    /// real path. The copy is removed when the handle is cleaned up.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut stage = || -> io::Result<NamedTempFile> {
            let mut temp = tempfile::Builder::new()
                .prefix("flicker_video_")
                .suffix(".mp4")
                .tempfile()?;
            io::copy(&mut reader, temp.as_file_mut())?;
            Ok(temp)
        };
        let temp = stage().map_err(|e| MediaError::SourceUnavailable {
            path: PathBuf::new(),
            reason: format!("failed to stage resource to temp file: {e}"),
        })?;
        Ok(Self {
            path: temp.path().to_path_buf(),
            temp: Some(temp),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the temp copy, if any. Failure is a teardown warning, not an
    /// error; the file is then left for removal at process exit.
    pub fn cleanup(&mut self) {
        if let Some(temp) = self.temp.take() {
            if let Err(e) = temp.close() {
                log::warn!("failed to delete temp video copy: {e}");
            }
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}
