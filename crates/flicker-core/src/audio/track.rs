//! Device playback of one extracted audio track.
//!
//! rodio's `OutputStream` is not `Send`, so the device lives on a dedicated
//! thread that owns the stream and sink and is commanded over a channel.
//! That also lets the decode thread restart audio on loop without touching
//! device state directly.

use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};

use crate::audio::extract::{self, PcmAudio};
use crate::error::{MediaError, Result};

/// How long `cleanup` waits for the playback thread before abandoning it.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum AudioCommand {
    Play,
    Pause,
    Stop,
    SetVolume(f32),
    Shutdown,
}

/// Lightweight transport handle for threads that do not own the track
/// (the decode loop restarts audio through this on loop-around).
#[derive(Clone)]
pub struct AudioHandle {
    tx: Sender<AudioCommand>,
}

impl AudioHandle {
    pub fn play(&self) {
        let _ = self.tx.send(AudioCommand::Play);
    }

    pub fn pause(&self) {
        let _ = self.tx.send(AudioCommand::Pause);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(AudioCommand::Stop);
    }
}

/// One playable audio track: whole-clip PCM plus its device handle.
///
/// At most one playback thread (and thus one device sink) exists per track.
/// All transport calls are fire-and-forget; a missing or failed output
/// device degrades to silence rather than failing the session.
#[derive(Debug)]
pub struct AudioTrack {
    tx: Option<Sender<AudioCommand>>,
    thread: Option<std::thread::JoinHandle<()>>,
    temp: Option<tempfile::NamedTempFile>,
    volume: f32,
    duration_secs: f64,
}

impl AudioTrack {
    /// Extract/transcode/decode the audio of `path` and start the playback
    /// thread. `AudioUnavailable` if no playable audio can be produced.
    pub fn prepare(path: &Path) -> Result<Self> {
        let (pcm, temp) = extract::prepare_pcm(path)?;
        let duration_secs = pcm.duration_secs();

        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || playback_thread(pcm, &rx))
            .map_err(|e| {
                MediaError::AudioUnavailable(format!("failed to spawn audio thread: {e}"))
            })?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            temp,
            volume: 1.0,
            duration_secs,
        })
    }

    /// Start or resume device playback.
    pub fn play(&self) {
        self.send(AudioCommand::Play);
    }

    /// Pause device playback, keeping the position.
    pub fn pause(&self) {
        self.send(AudioCommand::Pause);
    }

    /// Stop playback and rewind the device position to zero.
    pub fn stop(&self) {
        self.send(AudioCommand::Stop);
    }

    /// Set the playback volume multiplier. Negative values clamp to zero.
    /// Applied immediately if the device is up, otherwise remembered and
    /// applied when it comes up.
    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.max(0.0);
        self.volume = volume;
        self.send(AudioCommand::SetVolume(volume));
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    /// Transport handle for use from other threads. `None` once the track
    /// has been cleaned up.
    pub fn handle(&self) -> Option<AudioHandle> {
        self.tx.clone().map(|tx| AudioHandle { tx })
    }

    /// Stop playback, release the device, and best-effort remove the temp
    /// transcode. Safe to call multiple times.
    pub fn cleanup(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(AudioCommand::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let deadline = Instant::now() + SHUTDOWN_WAIT;
            while !thread.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                log::warn!("audio playback thread did not stop in time, abandoning");
            }
        }
        if let Some(temp) = self.temp.take() {
            if let Err(e) = temp.close() {
                log::warn!("failed to delete temp audio transcode: {e}");
            }
        }
    }

    fn send(&self, cmd: AudioCommand) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(cmd);
        }
    }
}

impl Drop for AudioTrack {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Thread body: owns the output stream and sink for this track's lifetime.
fn playback_thread(pcm: PcmAudio, rx: &Receiver<AudioCommand>) {
    // Opened lazily on the first Play so a track that is never started
    // never touches the device.
    let mut device: Option<(OutputStream, Sink)> = None;
    let mut device_failed = false;
    let mut volume = 1.0f32;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            AudioCommand::Play => {
                if device.is_none() && !device_failed {
                    match open_device(volume) {
                        Ok(d) => device = Some(d),
                        Err(e) => {
                            // Degrade to silent playback; don't retry per Play.
                            log::warn!("{e}, continuing without audio");
                            device_failed = true;
                        }
                    }
                }
                if let Some((_, sink)) = &device {
                    if sink.empty() {
                        sink.append(SamplesBuffer::new(
                            pcm.channels,
                            pcm.sample_rate,
                            pcm.samples.clone(),
                        ));
                    }
                    sink.play();
                }
            }
            AudioCommand::Pause => {
                if let Some((_, sink)) = &device {
                    sink.pause();
                }
            }
            AudioCommand::Stop => {
                // stop() clears the queued buffer, so the next Play
                // re-queues from sample zero: device-position rewind.
                if let Some((_, sink)) = &device {
                    sink.stop();
                }
            }
            AudioCommand::SetVolume(v) => {
                volume = v;
                if let Some((_, sink)) = &device {
                    sink.set_volume(v);
                }
            }
            AudioCommand::Shutdown => break,
        }
    }

    if let Some((_, sink)) = &device {
        sink.stop();
    }
    log::debug!("audio playback thread stopped");
}

fn open_device(volume: f32) -> Result<(OutputStream, Sink)> {
    let (stream, handle) = OutputStream::try_default()
        .map_err(|e| MediaError::DeviceError(format!("no audio output device: {e}")))?;
    let sink = Sink::try_new(&handle)
        .map_err(|e| MediaError::DeviceError(format!("failed to create audio sink: {e}")))?;
    sink.set_volume(volume);
    Ok((stream, sink))
}
