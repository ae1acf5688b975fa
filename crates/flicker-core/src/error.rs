use std::path::PathBuf;

use thiserror::Error;

/// Playback error kinds.
///
/// Propagation policy: `SourceUnavailable`/`UnsupportedStream` abort session
/// creation. `AudioUnavailable`/`DeviceError` downgrade to silent video.
/// `DecodeFailure` terminates only the affected decode loop. Teardown
/// problems are logged, never raised.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("source unavailable: {}: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("no decodable video track in {}: {reason}", path.display())]
    UnsupportedStream { path: PathBuf, reason: String },

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("audio unavailable: {0}")]
    AudioUnavailable(String),

    #[error("seek failed: {0}")]
    SeekFailed(String),

    #[error("audio device error: {0}")]
    DeviceError(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;
