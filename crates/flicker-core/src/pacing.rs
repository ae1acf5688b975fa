//! Wall-clock pacing for the decode loop.
//!
//! The schedule is `base + n * frame_duration`. When the loop runs early it
//! sleeps; when it falls more than two frame-durations behind it raises the
//! catch-up flag but keeps decoding every frame. Full frame delivery wins
//! over strict real-time pacing, so sustained overload shows as slowdown,
//! never as dropped frames.

use std::time::{Duration, Instant};

/// Scheduling jitter below this is ignored rather than slept away.
const NOISE_MARGIN: Duration = Duration::from_millis(1);

pub struct Pacer {
    frame_duration: Duration,
    next_target: Instant,
    frames_paced: u64,
    catching_up: bool,
}

impl Pacer {
    pub fn new(frame_duration: Duration) -> Self {
        Self::with_base(Instant::now(), frame_duration)
    }

    /// Start the schedule from an explicit base timestamp.
    pub fn with_base(base: Instant, frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            next_target: base,
            frames_paced: 0,
            catching_up: false,
        }
    }

    /// Called before decoding a frame. Returns how long to sleep if the
    /// loop is ahead of schedule; flags catch-up if it is far behind.
    pub fn pre_frame(&mut self, now: Instant) -> Option<Duration> {
        if now + NOISE_MARGIN < self.next_target {
            return Some(self.next_target - now);
        }
        if now > self.next_target + self.frame_duration * 2 {
            self.catching_up = true;
        }
        None
    }

    /// Account one decoded frame: advance the schedule and clear the
    /// catch-up flag once the loop is back within one frame-duration.
    pub fn frame_done(&mut self, now: Instant) {
        if self.catching_up && now <= self.next_target + self.frame_duration {
            self.catching_up = false;
        }
        self.next_target += self.frame_duration;
        self.frames_paced += 1;
    }

    /// Reset the schedule to start at `now` (loop restart).
    pub fn rewind(&mut self, now: Instant) {
        self.next_target = now;
        self.frames_paced = 0;
        self.catching_up = false;
    }

    pub fn catching_up(&self) -> bool {
        self.catching_up
    }

    pub fn frames_paced(&self) -> u64 {
        self.frames_paced
    }

    /// How far behind schedule the loop currently is (zero when on time).
    pub fn lag(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.next_target)
    }
}
