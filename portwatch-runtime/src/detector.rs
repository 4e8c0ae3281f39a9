//! Detection model boundary. Like the decoder, the model is an opaque
//! collaborator — this crate only needs a seam to call into it and a
//! deterministic double to exercise the inference loop in tests.

use portwatch_core::Detection;

use crate::frame::Frame;

/// Runs one frame through a detection model. Implementations are expected
/// to manage their own batching/executor internally; `detect` is treated
/// as a blocking, CPU-bound call from the inference loop's point of view.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<Detection>;
}

/// Detects nothing. Used where a worker's detections are intentionally
/// disabled (e.g. capacity/backoff tests that only care about the reader
/// side of the pipeline).
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&self, _frame: &Frame) -> Vec<Detection> {
        Vec::new()
    }
}

/// Deterministic single-box detector for tests: returns one detection per
/// call with a fixed confidence and a `track_id` that cycles, simulating a
/// tracker assigning stable ids across frames.
pub struct SyntheticDetector {
    class_id: u32,
    track_cycle: u64,
    calls: std::sync::atomic::AtomicU64,
}

impl SyntheticDetector {
    pub fn new(class_id: u32, track_cycle: u64) -> Self {
        Self {
            class_id,
            track_cycle,
            calls: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Detector for SyntheticDetector {
    fn detect(&self, _frame: &Frame) -> Vec<Detection> {
        let call = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        vec![Detection {
            x: 100.0,
            y: 100.0,
            width: 40.0,
            height: 20.0,
            confidence: 0.88,
            class_id: Some(self.class_id),
            track_id: Some(call % self.track_cycle.max(1)),
        }]
    }
}
