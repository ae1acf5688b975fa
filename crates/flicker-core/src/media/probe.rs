//! Container metadata via ffprobe subprocess.
//!
//! - `ffprobe` runs synchronously at session-load time
//! - JSON output gives dimensions, frame rate, duration, stream presence
//! - availability of ffmpeg/ffprobe is checked once per process

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;

use crate::error::MediaError;

/// Check if ffmpeg/ffprobe are available on the system. Cached per process.
pub fn ffmpeg_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        Command::new("ffprobe")
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

/// Video metadata from ffprobe.
#[derive(Debug, Clone)]
pub struct VideoMeta {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_secs: f64,
    pub has_audio: bool,
}

impl VideoMeta {
    /// Wall-clock time per frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1.0))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe video metadata using ffprobe.
///
/// `SourceUnavailable` if the file is missing or ffprobe cannot read it,
/// `UnsupportedStream` if the container has no video stream.
pub fn probe_video(path: &Path) -> Result<VideoMeta, MediaError> {
    if !path.exists() {
        return Err(MediaError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: "file not found".into(),
        });
    }

    let unavailable = |reason: String| MediaError::SourceUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let output = Command::new("ffprobe")
        .args([
            "-v", "quiet",
            "-print_format", "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| unavailable(format!("ffprobe failed to execute: {e}")))?;

    if !output.status.success() {
        return Err(unavailable("ffprobe returned non-zero exit code".into()));
    }

    let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| unavailable(format!("failed to parse ffprobe JSON: {e}")))?;

    meta_from_probe(&probe, path)
}

fn meta_from_probe(probe: &ProbeOutput, path: &Path) -> Result<VideoMeta, MediaError> {
    let unavailable = |reason: &str| MediaError::SourceUnavailable {
        path: path.to_path_buf(),
        reason: reason.into(),
    };

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| MediaError::UnsupportedStream {
            path: path.to_path_buf(),
            reason: "no video stream found".into(),
        })?;

    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let width = video.width.ok_or_else(|| unavailable("missing width"))?;
    let height = video.height.ok_or_else(|| unavailable("missing height"))?;

    let fps = parse_frame_rate(video.r_frame_rate.as_deref().unwrap_or("30/1"));

    // Container duration is authoritative; fall back to the stream's own.
    let duration_secs = probe
        .format
        .duration
        .as_deref()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| video.duration.as_deref().and_then(|s| s.parse::<f64>().ok()))
        .unwrap_or(0.0);

    Ok(VideoMeta {
        width,
        height,
        fps,
        duration_secs,
        has_audio,
    })
}

/// Parse ffprobe's rational frame rate ("30000/1001") into frames/second.
fn parse_frame_rate(rate: &str) -> f64 {
    if let Some((num, den)) = rate.split_once('/') {
        let n: f64 = num.parse().unwrap_or(30.0);
        let d: f64 = den.parse().unwrap_or(1.0);
        if d > 0.0 { n / d } else { 30.0 }
    } else {
        rate.parse().unwrap_or(30.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_rational_and_plain() {
        assert_eq!(parse_frame_rate("30/1"), 30.0);
        assert!((parse_frame_rate("30000/1001") - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), 25.0);
        assert_eq!(parse_frame_rate("30/0"), 30.0);
        assert_eq!(parse_frame_rate("garbage"), 30.0);
    }

    #[test]
    fn frame_duration_from_fps() {
        let meta = VideoMeta {
            width: 640,
            height: 480,
            fps: 30.0,
            duration_secs: 2.0,
            has_audio: false,
        };
        let dur = meta.frame_duration();
        assert!((dur.as_secs_f64() - 1.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let err = probe_video(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(matches!(err, MediaError::SourceUnavailable { .. }));
    }

    #[test]
    fn meta_from_typical_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "width": 1920, "height": 1080,
                 "r_frame_rate": "30000/1001", "duration": "12.300000"},
                {"codec_type": "audio"}
            ],
            "format": {"duration": "12.345000"}
        }"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let meta = meta_from_probe(&probe, Path::new("clip.mp4")).unwrap();
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.height, 1080);
        assert!((meta.fps - 29.97).abs() < 0.01);
        assert!((meta.duration_secs - 12.345).abs() < 1e-9);
        assert!(meta.has_audio);
    }

    #[test]
    fn audio_only_container_is_unsupported() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {}}"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let err = meta_from_probe(&probe, Path::new("song.mp3")).unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedStream { .. }));
    }

    #[test]
    fn stream_duration_backfills_missing_format_duration() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "width": 64, "height": 64,
                 "r_frame_rate": "25/1", "duration": "4.0"}
            ],
            "format": {}
        }"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let meta = meta_from_probe(&probe, Path::new("clip.mp4")).unwrap();
        assert!((meta.duration_secs - 4.0).abs() < 1e-9);
        assert!(!meta.has_audio);
    }
}
