//! Frame buffers and the single-slot mailbox between decoder and renderer.
//!
//! - Exactly two `FrameBuffer`s exist per session; they are swapped through
//!   the mailbox instead of reallocated per frame
//! - `publish` hands the consumer the freshest frame and returns the
//!   previously published buffer as the producer's next decode target
//! - `peek_with` reads without removing, so the consumer can re-render a
//!   stale frame rather than stall

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Fixed-size RGBA8 pixel buffer (width * height * 4 bytes).
pub struct FrameBuffer {
    pub data: Box<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Monotonic publish sequence number, stamped by the decode loop.
    pub seq: u64,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * 4;
        Self {
            data: vec![0u8; len].into_boxed_slice(),
            width,
            height,
            seq: 0,
        }
    }
}

/// Single-slot, lock-free hand-off of the latest decoded frame.
///
/// One producer (the decode thread) and one consumer (the render tick).
/// The producer is never blocked by the consumer and vice versa. Latest
/// wins: a publish that the consumer never peeked is silently replaced.
pub struct Mailbox {
    slot: AtomicPtr<FrameBuffer>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish a completed frame, returning the previously published buffer
    /// (the producer's next write target). Returns `None` on the first
    /// publish; the producer then switches to the other buffer of the pair.
    pub fn publish(&self, frame: Box<FrameBuffer>) -> Option<Box<FrameBuffer>> {
        let prev = self.slot.swap(Box::into_raw(frame), Ordering::AcqRel);
        if prev.is_null() {
            None
        } else {
            // SAFETY: only `publish`/`take` store into the slot, and both
            // store pointers obtained from Box::into_raw. The swap removed
            // this pointer from the slot, so we are the sole owner again.
            Some(unsafe { Box::from_raw(prev) })
        }
    }

    /// Run `f` against the currently published frame without removing it.
    /// Repeated peeks between publishes see the same frame.
    ///
    /// The producer only ever writes into the buffer returned by its own
    /// previous `publish`, never the one sitting in the slot. A consumer
    /// that straddles two publishes can observe a stale frame; re-rendering
    /// it is harmless.
    pub fn peek_with<R>(&self, f: impl FnOnce(&FrameBuffer) -> R) -> Option<R> {
        let p = self.slot.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            // SAFETY: p came from Box::into_raw in `publish` and stays valid
            // until `take` or Drop reclaims it; the producer does not write
            // through the published pointer.
            Some(f(unsafe { &*p }))
        }
    }

    /// Remove and return the published frame, leaving the slot empty.
    /// Used when stopping a session so a stale frame is not re-rendered.
    pub fn take(&self) -> Option<Box<FrameBuffer>> {
        let prev = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if prev.is_null() {
            None
        } else {
            // SAFETY: same ownership argument as in `publish`.
            Some(unsafe { Box::from_raw(prev) })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load(Ordering::Acquire).is_null()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        let _ = self.take();
    }
}

// SAFETY: the slot is only accessed through atomic swap/load; buffer
// ownership transfers with the pointer.
unsafe impl Send for Mailbox {}
// SAFETY: see above; peek never mutates.
unsafe impl Sync for Mailbox {}
