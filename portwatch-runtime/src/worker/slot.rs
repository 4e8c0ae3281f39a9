use parking_lot::Mutex;

use crate::frame::Frame;

/// Single-slot, overwritten handoff from the reader thread to the
/// inference thread: a 3-tuple of `(frame, frame_index, timestamp_ms)`
/// guarded by a mutex.
pub struct LatestFrameSlot {
    inner: Mutex<Option<(Frame, u64, f64)>>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, frame: Frame, frame_index: u64, timestamp_ms: f64) {
        *self.inner.lock() = Some((frame, frame_index, timestamp_ms));
    }

    pub fn get(&self) -> Option<(Frame, u64, f64)> {
        self.inner.lock().clone()
    }
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Shares the reader's sanitized source fps with the inference thread,
/// which needs it to fill the `fps` field of each `detections` payload
/// but only learns it once the reader has opened the source.
pub struct FpsCell(std::sync::atomic::AtomicU64);

impl FpsCell {
    pub fn new(initial: f64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(initial.to_bits()))
    }

    pub fn set(&self, fps: f64) {
        self.0.store(fps.to_bits(), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(std::sync::atomic::Ordering::Relaxed))
    }
}
