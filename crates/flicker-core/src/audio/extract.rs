//! Extract a container's audio track to playable PCM.
//!
//! - WAV inputs are decoded as-is
//! - anything else is transcoded once, fully, to a temp WAV via ffmpeg
//!   before being decoded to PCM in memory
//! - whole-clip in-memory PCM; fine for short clips, a scalability limit
//!   for long-form audio (streaming decode would be the fix)

use std::path::Path;
use std::process::{Command, Stdio};

use tempfile::NamedTempFile;

use crate::error::{MediaError, Result};

/// Decoded PCM payload ready for device playback.
#[derive(Debug)]
pub struct PcmAudio {
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl PcmAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate) / f64::from(self.channels)
    }
}

/// Decode the audio track of `path` to PCM, transcoding through a temp WAV
/// when the input is not already WAV. Returns the PCM plus the temp file
/// (if one was created) so the caller controls its lifetime.
pub fn prepare_pcm(path: &Path) -> Result<(PcmAudio, Option<NamedTempFile>)> {
    if !path.exists() {
        return Err(MediaError::AudioUnavailable(format!(
            "file not found: {}",
            path.display()
        )));
    }

    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));

    if is_wav {
        // Already in the directly playable format.
        return Ok((decode_wav(path)?, None));
    }

    let temp = tempfile::Builder::new()
        .prefix("flicker_audio_")
        .suffix(".wav")
        .tempfile()
        .map_err(|e| MediaError::AudioUnavailable(format!("temp wav creation failed: {e}")))?;

    transcode_to_wav(path, temp.path())?;
    let pcm = decode_wav(temp.path())?;
    Ok((pcm, Some(temp)))
}

/// Run ffmpeg once to extract/transcode the audio track to 44.1kHz stereo
/// s16le WAV.
fn transcode_to_wav(input: &Path, output: &Path) -> Result<()> {
    let status = Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(input)
        .args([
            "-vn",
            "-acodec", "pcm_s16le",
            "-ar", "44100",
            "-ac", "2",
            "-v", "quiet",
        ])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| MediaError::AudioUnavailable(format!("ffmpeg failed to execute: {e}")))?;

    if !status.success() {
        return Err(MediaError::AudioUnavailable(
            "ffmpeg audio extraction returned non-zero exit code (no audio track or corrupt stream?)"
                .into(),
        ));
    }
    Ok(())
}

/// Decode a WAV file to interleaved i16 samples.
fn decode_wav(path: &Path) -> Result<PcmAudio> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| MediaError::AudioUnavailable(format!("wav open failed: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| MediaError::AudioUnavailable(format!("wav decode failed: {e}")))?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| MediaError::AudioUnavailable(format!("wav decode failed: {e}")))?,
        (fmt, bits) => {
            return Err(MediaError::AudioUnavailable(format!(
                "unsupported wav sample format: {fmt:?}/{bits}bit"
            )));
        }
    };

    log::info!(
        "audio prepared: {}ch {}Hz, {} samples",
        spec.channels,
        spec.sample_rate,
        samples.len()
    );

    Ok(PcmAudio {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        samples,
    })
}
