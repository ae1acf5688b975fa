//! Non-blocking video playback core.
//!
//! A background thread decodes frames via an ffmpeg subprocess and paces
//! itself against the wall clock; the host's render thread picks up the
//! freshest frame from a lock-free single-slot mailbox whenever it gets
//! around to it. Audio (when the container has a track) is extracted up
//! front and played on its own device thread, and every audio failure
//! degrades to silent video instead of failing playback.
//!
//! Typical embedding: construct a [`Controller`], implement
//! [`ConsumerThreadOps`] over your renderer's texture API, call
//! [`Controller::play_file`] from anywhere, and drive
//! [`Controller::on_tick`] once per displayed frame from the render thread.

pub mod audio;
pub mod controller;
pub mod error;
pub mod events;
pub mod frame;
pub mod media;
pub mod pacing;
pub mod session;

pub use audio::{AudioHandle, AudioTrack};
pub use controller::{ConsumerThreadOps, Controller, SessionId, TextureId};
pub use error::{MediaError, Result};
pub use events::EventRegistry;
pub use frame::{FrameBuffer, Mailbox};
pub use media::probe::{VideoMeta, ffmpeg_available, probe_video};
pub use media::{AbortHandle, FrameStatus, PixelLayout, SourceHandle, VideoSource};
pub use pacing::Pacer;
pub use session::{PlayOptions, PlaybackSession, PlaybackState};
