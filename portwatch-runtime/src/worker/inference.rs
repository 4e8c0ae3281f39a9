//! Inference thread: polls the latest-frame slot, skip-to-latest on a
//! stalled index, runs the detector, and emits a `detections` payload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use portwatch_core::{BusMessage, DetectedVessel, DetectionPayload};

use crate::bus::EventBusAdapter;
use crate::detector::Detector;
use crate::queue::DropOldestQueue;
use crate::worker::handle::StopSignal;
use crate::worker::slot::{FpsCell, LatestFrameSlot};

/// How long the loop sleeps between polls when the frame index hasn't
/// advanced.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Exponential moving average of measured inference duration, converted
/// to a rate, so a single slow frame doesn't make `inference_fps` jump
/// around.
struct RollingRate {
    average_secs: f64,
}

impl RollingRate {
    fn new() -> Self {
        Self { average_secs: 0.0 }
    }

    fn sample(&mut self, elapsed: Duration) -> f64 {
        let sample = elapsed.as_secs_f64().max(1e-6);
        self.average_secs = if self.average_secs == 0.0 {
            sample
        } else {
            0.8 * self.average_secs + 0.2 * sample
        };
        1.0 / self.average_secs
    }
}

pub struct InferenceContext {
    pub stream_id: String,
    pub detector: Arc<dyn Detector>,
    pub event_bus: Arc<dyn EventBusAdapter>,
    pub latest_frame: Arc<LatestFrameSlot>,
    pub fps_cell: Arc<FpsCell>,
    pub detection_out: Arc<DropOldestQueue<BusMessage>>,
    pub stop: StopSignal,
}

pub async fn run(ctx: InferenceContext) {
    let mut last_seen_index: Option<u64> = None;
    let mut rolling_rate = RollingRate::new();

    loop {
        if ctx.stop.is_stopped() {
            return;
        }

        let advanced = ctx
            .latest_frame
            .get()
            .filter(|(_, frame_index, _)| Some(*frame_index) != last_seen_index);

        let Some((frame, frame_index, timestamp_ms)) = advanced else {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                _ = ctx.stop.wait_for_stop() => return,
            }
        };
        last_seen_index = Some(frame_index);

        let started = Instant::now();
        let detections = ctx.detector.detect(&frame);
        let inference_fps = rolling_rate.sample(started.elapsed());

        let vessels = detections
            .into_iter()
            .map(|detection| DetectedVessel::new(detection, "vessel"))
            .collect::<Vec<_>>();

        let payload = DetectionPayload::new(
            frame_index,
            timestamp_ms,
            timestamp_ms,
            ctx.fps_cell.get(),
            inference_fps,
            vessels,
        );
        let message = BusMessage::Detections(payload);

        ctx.event_bus.publish(&ctx.stream_id, &message).await;
        ctx.detection_out.put(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcEventBus;
    use crate::detector::{NullDetector, SyntheticDetector};
    use crate::frame::Frame;

    #[tokio::test(start_paused = true)]
    async fn skips_inference_when_frame_index_unchanged() {
        let latest_frame = Arc::new(LatestFrameSlot::new());
        latest_frame.set(Frame::new(std::sync::Arc::from([]), None), 1, 10.0);

        let detector = Arc::new(SyntheticDetector::new(1, 4));
        let detection_out = Arc::new(DropOldestQueue::new(8));
        let stop = StopSignal::new();

        let ctx = InferenceContext {
            stream_id: "cam-1".to_string(),
            detector: detector.clone(),
            event_bus: Arc::new(InProcEventBus::new(8)),
            latest_frame: latest_frame.clone(),
            fps_cell: Arc::new(FpsCell::new(25.0)),
            detection_out: detection_out.clone(),
            stop: stop.clone(),
        };

        let handle = tokio::spawn(run(ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(detection_out.len(), 1);

        stop.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drops_detections_to_queue_with_drop_oldest_policy() {
        let latest_frame = Arc::new(LatestFrameSlot::new());
        let detection_out = Arc::new(DropOldestQueue::new(1));
        let stop = StopSignal::new();

        let ctx = InferenceContext {
            stream_id: "cam-1".to_string(),
            detector: Arc::new(NullDetector),
            event_bus: Arc::new(InProcEventBus::new(8)),
            latest_frame: latest_frame.clone(),
            fps_cell: Arc::new(FpsCell::new(25.0)),
            detection_out: detection_out.clone(),
            stop: stop.clone(),
        };
        let handle = tokio::spawn(run(ctx));

        for i in 0..5u64 {
            latest_frame.set(Frame::new(std::sync::Arc::from([]), None), i, i as f64);
            tokio::time::sleep(POLL_INTERVAL * 2).await;
        }
        assert!(detection_out.len() <= 1);

        stop.stop();
        handle.await.unwrap();
    }
}
