//! Wires the reader, inference, and media-publisher-health tasks into one
//! worker "process". This is the module the orchestrator and watchdog
//! call into to spawn and tear down a stream's pipeline.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use portwatch_core::{BusMessage, OrchestratorConfig, StreamConfig};
use tracing::warn;

use crate::bus::EventBusAdapter;
use crate::detector::Detector;
use crate::frame::FrameSourceFactory;
use crate::media::{EncoderLauncher, MediaPublisher};
use crate::queue::DropOldestQueue;
use crate::worker::handle::{StopSignal, WorkerProcessHandle};
use crate::worker::inference::{self, InferenceContext};
use crate::worker::reader::{self, ReaderContext};
use crate::worker::slot::{FpsCell, LatestFrameSlot};

const PUBLISHER_HEALTH_POLL: Duration = Duration::from_millis(500);

/// Collaborators a worker needs that are opaque to this crate's own
/// logic (decoder, detector, bus transport, encoder). Built once by
/// whoever owns the `Orchestrator` and shared across every worker spawn.
pub struct WorkerDeps {
    pub frame_source_factory: Arc<dyn FrameSourceFactory>,
    pub detector: Arc<dyn Detector>,
    pub event_bus: Arc<dyn EventBusAdapter>,
    pub encoder_launcher: Arc<dyn EncoderLauncher>,
}

pub struct SpawnedWorker {
    pub process: WorkerProcessHandle,
    pub detection_out: Arc<DropOldestQueue<BusMessage>>,
    pub media_publisher: Arc<MediaPublisher>,
    pub exited_with_error: Arc<AtomicBool>,
}

/// Spawns the reader and inference tasks for one stream and starts the
/// media publisher. An encoder fallback-chain exhaustion does not fail
/// the spawn — `EncoderFailure` is handled entirely inside the media
/// publisher without killing the worker.
pub async fn spawn(
    config: &StreamConfig,
    deps: &WorkerDeps,
    runtime_config: &OrchestratorConfig,
) -> SpawnedWorker {
    let stream_id = config.stream_id().to_string();

    let media_publisher = Arc::new(MediaPublisher::new(
        stream_id.clone(),
        runtime_config.codec_preference.clone(),
        deps.encoder_launcher.clone(),
    ));
    let copy_eligible = !config.loop_playback || config.is_remote();
    if let Err(error) = media_publisher.start(copy_eligible).await {
        warn!(stream_id = %stream_id, %error, "media publisher failed to start, continuing without publish");
    }

    let latest_frame = Arc::new(LatestFrameSlot::new());
    let fps_cell = Arc::new(FpsCell::new(25.0));
    let detection_out: Arc<DropOldestQueue<BusMessage>> =
        Arc::new(DropOldestQueue::new(runtime_config.detection_queue_size));
    deps.event_bus.register_local_sink(&stream_id, detection_out.clone());

    let stop = StopSignal::new();
    let exited_with_error = Arc::new(AtomicBool::new(false));

    let reader_handle = tokio::spawn(reader::run(ReaderContext {
        stream_id: stream_id.clone(),
        source_url: config.source_url().to_string(),
        loop_playback: config.loop_playback,
        is_remote: config.is_remote(),
        max_catchup_skip: runtime_config.max_catchup_skip,
        frame_source_factory: deps.frame_source_factory.clone(),
        media_publisher: media_publisher.clone(),
        event_bus: deps.event_bus.clone(),
        latest_frame: latest_frame.clone(),
        fps_cell: fps_cell.clone(),
        stop: stop.clone(),
        exited_with_error: exited_with_error.clone(),
    }));

    let inference_handle = tokio::spawn(inference::run(InferenceContext {
        stream_id: stream_id.clone(),
        detector: deps.detector.clone(),
        event_bus: deps.event_bus.clone(),
        latest_frame,
        fps_cell,
        detection_out: detection_out.clone(),
        stop: stop.clone(),
    }));

    spawn_publisher_health_watch(media_publisher.clone(), stop.clone());

    SpawnedWorker {
        process: WorkerProcessHandle::new(stop, reader_handle, inference_handle),
        detection_out,
        media_publisher,
        exited_with_error,
    }
}

fn spawn_publisher_health_watch(publisher: Arc<MediaPublisher>, stop: StopSignal) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PUBLISHER_HEALTH_POLL) => {}
                _ = stop.wait_for_stop() => return,
            }
            publisher.check_health().await;
        }
    });
}

/// Releases everything the worker held once its tasks have stopped:
/// closes the media publisher, unregisters the event bus sink, and
/// enqueues the terminal sentinel so any blocked `detection_out` consumer
/// unblocks.
pub async fn teardown(
    stream_id: &str,
    media_publisher: &MediaPublisher,
    event_bus: &dyn EventBusAdapter,
    detection_out: &DropOldestQueue<BusMessage>,
) {
    media_publisher.close().await;
    event_bus.unregister_local_sink(stream_id);
    detection_out.put(BusMessage::Terminal);
}
