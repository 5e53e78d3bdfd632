//! Frames and the latest-frame handoff.
//!
//! - `Frame`: RGB pixel buffer plus capture instant. Immutable once published.
//! - `FrameSlot`: single-item overwrite buffer shared by the capture loop (one
//!   writer) and every stream generator (many readers).
//!
//! The slot never queues. A publish replaces whatever was there, so a slow
//! viewer simply skips frames and memory stays bounded at one frame.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use image::RgbImage;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A captured (and possibly annotated) camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from packed RGB8 bytes. Returns `None` on a size mismatch.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(Self::new)
    }

    /// Solid-colour frame, mostly useful for tests and synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }
}

// ----------------------------------------------------------------------------
// FrameSlot
// ----------------------------------------------------------------------------

/// Position of a reader relative to the slot's history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotCursor {
    /// Number of publishes seen so far.
    pub sequence: u64,
    /// Number of clears seen so far.
    pub epoch: u64,
}

/// What a reader observed after waiting on the slot.
#[derive(Clone, Debug)]
pub struct SlotView {
    pub frame: Option<Arc<Frame>>,
    pub cursor: SlotCursor,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    cursor: SlotCursor,
}

/// Single-item, overwrite-on-write frame buffer.
///
/// Readers get an `Arc<Frame>`; the frame behind it is never written again, so
/// it stays valid after the lock is released and across later publishes.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    updated: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Returns the new publish sequence number.
    pub fn publish(&self, frame: Frame) -> u64 {
        let frame = Arc::new(frame);
        let sequence = {
            let mut state = self.lock();
            state.frame = Some(frame);
            state.cursor.sequence += 1;
            state.cursor.sequence
        };
        self.updated.notify_all();
        sequence
    }

    /// Latest published frame, if any.
    pub fn snapshot(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    /// Drop the current frame and start a new epoch. Wakes every waiting reader.
    pub fn clear(&self) {
        {
            let mut state = self.lock();
            state.frame = None;
            state.cursor.epoch += 1;
        }
        self.updated.notify_all();
    }

    pub fn cursor(&self) -> SlotCursor {
        self.lock().cursor
    }

    /// Current frame and cursor, read atomically.
    pub fn view(&self) -> SlotView {
        let state = self.lock();
        SlotView {
            frame: state.frame.clone(),
            cursor: state.cursor,
        }
    }

    /// Block until the slot moves past `seen` (publish or clear) or `timeout`
    /// elapses, then report the current contents.
    pub fn wait_for_update(&self, seen: SlotCursor, timeout: Duration) -> SlotView {
        let guard = self.lock();
        let (state, _timeout) = self
            .updated
            .wait_timeout_while(guard, timeout, |state| state.cursor == seen)
            .unwrap_or_else(PoisonError::into_inner);
        SlotView {
            frame: state.frame.clone(),
            cursor: state.cursor,
        }
    }

    // A panicking holder can only have been mid-assignment of whole values, so
    // the state behind a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
