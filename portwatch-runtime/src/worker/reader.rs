//! Reader thread: decodes frames, derives timestamps, applies the
//! catch-up/loop/reconnect policies, and hands each frame to the media
//! publisher, the event bus, and the inference thread's latest-frame slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use portwatch_core::{BusMessage, FrameMetaPayload, ReadyPayload};

use crate::bus::EventBusAdapter;
use crate::frame::{DecodeOutcome, Frame, FrameSource, FrameSourceFactory};
use crate::media::MediaPublisher;
use crate::worker::handle::StopSignal;
use crate::worker::slot::{FpsCell, LatestFrameSlot};

const MIN_FPS: f64 = 1.0;
const MAX_FPS: f64 = 120.0;
const DEFAULT_FPS: f64 = 25.0;
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(8);

pub struct ReaderContext {
    pub stream_id: String,
    pub source_url: String,
    pub loop_playback: bool,
    pub is_remote: bool,
    pub max_catchup_skip: u32,
    pub frame_source_factory: Arc<dyn FrameSourceFactory>,
    pub media_publisher: Arc<MediaPublisher>,
    pub event_bus: Arc<dyn EventBusAdapter>,
    pub latest_frame: Arc<LatestFrameSlot>,
    pub fps_cell: Arc<FpsCell>,
    pub stop: StopSignal,
    /// Set before the task exits if it hit a fatal (non-recoverable)
    /// source error, so worker teardown can distinguish voluntary exit
    /// from `SourceOpenFailure`/local `SourceReadFailure`.
    pub exited_with_error: Arc<AtomicBool>,
}

fn sanitize_fps(fps: f64) -> f64 {
    if fps.is_finite() && fps >= MIN_FPS && fps <= MAX_FPS {
        fps
    } else {
        DEFAULT_FPS
    }
}

fn derive_timestamp_ms(frame: &Frame, start_mono: Instant, last_timestamp_ms: f64) -> f64 {
    let candidate = match frame.pts_ms {
        Some(pts) if pts > 0.0 => pts,
        _ => start_mono.elapsed().as_secs_f64() * 1000.0,
    };
    candidate.max(last_timestamp_ms)
}

async fn catch_up(
    source: &mut dyn FrameSource,
    start_mono: Instant,
    frame_period: Duration,
    max_skip: u32,
    frame_index: &mut u64,
) {
    let expected = (start_mono.elapsed().as_secs_f64() / frame_period.as_secs_f64()) as u64;
    if expected <= frame_index.saturating_add(1) {
        return;
    }
    let behind = (expected - *frame_index).min(u64::from(max_skip));
    for _ in 0..behind {
        match source.skip_frame().await {
            Ok(DecodeOutcome::Frame(_)) => *frame_index += 1,
            Ok(DecodeOutcome::Eof) | Err(_) => break,
        }
    }
}

pub async fn run(ctx: ReaderContext) {
    let mut source = match ctx.frame_source_factory.open(&ctx.source_url).await {
        Ok(source) => source,
        Err(error) => {
            warn!(stream_id = %ctx.stream_id, %error, "failed to open source, worker exiting");
            ctx.exited_with_error.store(true, Ordering::SeqCst);
            return;
        }
    };

    let fps = sanitize_fps(source.probe_fps());
    ctx.fps_cell.set(fps);
    let (width, height) = source.probe_dimensions();
    ctx.event_bus
        .publish(&ctx.stream_id, &BusMessage::Ready(ReadyPayload::new(width, height, fps)))
        .await;

    let frame_period = Duration::from_secs_f64(1.0 / fps);
    let start_mono = Instant::now();
    let mut frame_index: u64 = 0;
    let mut last_timestamp_ms: f64 = 0.0;
    let mut reconnect_backoff = RECONNECT_INITIAL_BACKOFF;

    loop {
        if ctx.stop.is_stopped() {
            return;
        }

        match source.next_frame().await {
            Ok(DecodeOutcome::Frame(frame)) => {
                reconnect_backoff = RECONNECT_INITIAL_BACKOFF;

                let timestamp_ms = derive_timestamp_ms(&frame, start_mono, last_timestamp_ms);
                last_timestamp_ms = timestamp_ms;

                ctx.media_publisher.feed(&frame).await;

                let frame_sent_at_ms = start_mono.elapsed().as_secs_f64() * 1000.0;
                ctx.event_bus
                    .publish(
                        &ctx.stream_id,
                        &BusMessage::FrameMeta(FrameMetaPayload::new(
                            frame_index,
                            timestamp_ms,
                            frame_sent_at_ms,
                            fps,
                        )),
                    )
                    .await;

                ctx.latest_frame.set(frame, frame_index, timestamp_ms);
                frame_index += 1;

                if !ctx.is_remote {
                    catch_up(
                        source.as_mut(),
                        start_mono,
                        frame_period,
                        ctx.max_catchup_skip,
                        &mut frame_index,
                    )
                    .await;
                }

                tokio::select! {
                    _ = tokio::time::sleep(frame_period) => {}
                    _ = ctx.stop.wait_for_stop() => return,
                }
            }
            Ok(DecodeOutcome::Eof) => {
                if ctx.loop_playback && !ctx.is_remote && source.seek_start().await.is_ok() {
                    frame_index = 0;
                    last_timestamp_ms = 0.0;
                    continue;
                }
                return;
            }
            Err(error) => {
                if !ctx.is_remote {
                    warn!(stream_id = %ctx.stream_id, %error, "local source read failure, worker exiting");
                    ctx.exited_with_error.store(true, Ordering::SeqCst);
                    return;
                }

                warn!(stream_id = %ctx.stream_id, %error, "read failure, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_backoff) => {}
                    _ = ctx.stop.wait_for_stop() => return,
                }
                reconnect_backoff = (reconnect_backoff * 2).min(RECONNECT_MAX_BACKOFF);

                match ctx.frame_source_factory.open(&ctx.source_url).await {
                    Ok(reopened) => {
                        source = reopened;
                        frame_index = 0;
                        last_timestamp_ms = 0.0;
                    }
                    Err(error) => {
                        warn!(stream_id = %ctx.stream_id, %error, "reconnect attempt failed, retrying");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcEventBus;
    use crate::frame::SyntheticFrameSourceFactory;
    use crate::media::{EncoderLauncher, EncoderProcess, EncoderExit, PublishMode, SpawnError};
    use async_trait::async_trait;

    struct NullEncoderProcess;

    #[async_trait]
    impl EncoderProcess for NullEncoderProcess {
        async fn feed(&mut self, _frame: &Frame) -> anyhow::Result<()> {
            Ok(())
        }
        fn poll_exit(&mut self) -> Option<EncoderExit> {
            None
        }
        async fn kill(&mut self) {}
    }

    struct NullEncoderLauncher;

    #[async_trait]
    impl EncoderLauncher for NullEncoderLauncher {
        async fn spawn(
            &self,
            _stream_id: &str,
            _codec: &str,
            _mode: PublishMode,
        ) -> Result<Box<dyn EncoderProcess>, SpawnError> {
            Ok(Box::new(NullEncoderProcess))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finite_local_source_runs_to_eof_without_looping() {
        let factory = Arc::new(SyntheticFrameSourceFactory {
            fps: 50.0,
            local: true,
            frame_count: Some(5),
        });
        let publisher = Arc::new(MediaPublisher::new(
            "cam-1",
            vec!["sw".to_string()],
            Arc::new(NullEncoderLauncher),
        ));
        publisher.start(false).await.unwrap();
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe("cam-1");
        let latest_frame = Arc::new(LatestFrameSlot::new());

        let ctx = ReaderContext {
            stream_id: "cam-1".to_string(),
            source_url: "file:///clip.mp4".to_string(),
            loop_playback: false,
            is_remote: false,
            max_catchup_skip: 5,
            frame_source_factory: factory,
            media_publisher: publisher,
            event_bus: bus,
            latest_frame: latest_frame.clone(),
            fps_cell: Arc::new(FpsCell::new(25.0)),
            stop: StopSignal::new(),
            exited_with_error: Arc::new(AtomicBool::new(false)),
        };

        run(ctx).await;

        assert!(matches!(rx.recv().await.unwrap(), BusMessage::Ready(_)));
        let (_, last_index, _) = latest_frame.get().expect("frame was decoded");
        assert_eq!(last_index, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_marks_exited_with_error() {
        struct FailingFactory;
        #[async_trait]
        impl FrameSourceFactory for FailingFactory {
            async fn open(&self, _source_url: &str) -> anyhow::Result<Box<dyn FrameSource>> {
                anyhow::bail!("no such device")
            }
        }

        let publisher = Arc::new(MediaPublisher::new(
            "cam-1",
            vec!["sw".to_string()],
            Arc::new(NullEncoderLauncher),
        ));
        let exited_with_error = Arc::new(AtomicBool::new(false));
        let ctx = ReaderContext {
            stream_id: "cam-1".to_string(),
            source_url: "rtsp://host/live".to_string(),
            loop_playback: false,
            is_remote: true,
            max_catchup_skip: 5,
            frame_source_factory: Arc::new(FailingFactory),
            media_publisher: publisher,
            event_bus: Arc::new(InProcEventBus::new(16)),
            latest_frame: Arc::new(LatestFrameSlot::new()),
            fps_cell: Arc::new(FpsCell::new(25.0)),
            stop: StopSignal::new(),
            exited_with_error: exited_with_error.clone(),
        };

        run(ctx).await;
        assert!(exited_with_error.load(Ordering::SeqCst));
    }
}
