//! Audio extraction and playback for a session's audio track.
//!
//! Audio is non-fatal to video playback: every failure in this module
//! downgrades the session to silent video.

pub mod extract;
pub mod track;

pub use track::{AudioHandle, AudioTrack};
