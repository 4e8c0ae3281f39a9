//! End-to-end scenarios for the orchestrator's public contract: viewer
//! hot-restart, capacity cap, crash+backoff restart, and concurrent
//! starts racing on distinct/shared ids.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use portwatch_core::{OrchestratorConfig, OrchestratorError, StreamConfig};
use portwatch_runtime::bus::InProcEventBus;
use portwatch_runtime::media::{EncoderExit, EncoderLauncher, EncoderProcess, PublishMode, SpawnError};
use portwatch_runtime::{Frame, NullDetector, Orchestrator, SyntheticFrameSourceFactory, WorkerDeps};

struct NullProcess;

#[async_trait]
impl EncoderProcess for NullProcess {
    async fn feed(&mut self, _frame: &Frame) -> anyhow::Result<()> {
        Ok(())
    }
    fn poll_exit(&mut self) -> Option<EncoderExit> {
        None
    }
    async fn kill(&mut self) {}
}

struct NullLauncher;

#[async_trait]
impl EncoderLauncher for NullLauncher {
    async fn spawn(
        &self,
        _stream_id: &str,
        _codec: &str,
        _mode: PublishMode,
    ) -> Result<Box<dyn EncoderProcess>, SpawnError> {
        Ok(Box::new(NullProcess))
    }
}

/// A long-lived, never-EOF source: used for liveness/crash scenarios
/// where the test kills the worker itself rather than waiting on EOF.
fn remote_deps() -> WorkerDeps {
    WorkerDeps {
        frame_source_factory: Arc::new(SyntheticFrameSourceFactory {
            fps: 30.0,
            local: false,
            frame_count: None,
        }),
        detector: Arc::new(NullDetector),
        event_bus: Arc::new(InProcEventBus::new(16)),
        encoder_launcher: Arc::new(NullLauncher),
    }
}

fn config_with(max_workers: usize, watchdog_period: Duration) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.max_workers = max_workers;
    config.watchdog_period = watchdog_period;
    config
}

#[tokio::test(start_paused = true)]
async fn viewer_hot_restart_after_no_viewer_timeout() {
    let mut config = config_with(8, Duration::from_millis(20));
    config.no_viewer_timeout = Duration::from_millis(50);
    let orchestrator = Orchestrator::new(config, remote_deps());

    let cfg = StreamConfig::new("cam-1", "rtsp://host/live", true).unwrap();
    orchestrator.start_stream(cfg).await.unwrap();

    let streams = orchestrator.list_streams().await;
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].viewer_count, 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(orchestrator.list_streams().await.is_empty());

    let snapshot = orchestrator.acquire_stream_viewer("cam-1").await.unwrap();
    assert_eq!(snapshot.viewer_count, 1);
    assert!(snapshot.is_alive);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn capacity_cap_rejects_the_overflow_stream() {
    let config = config_with(3, Duration::from_secs(3600));
    let orchestrator = Orchestrator::new(config, remote_deps());

    for i in 0..3 {
        let cfg = StreamConfig::new(format!("s-{i}"), "rtsp://host/live", false).unwrap();
        orchestrator.start_stream(cfg).await.unwrap();
    }

    let overflow = StreamConfig::new("s-3", "rtsp://host/live", false).unwrap();
    let err = orchestrator.start_stream(overflow).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CapacityExceeded));
    assert_eq!(orchestrator.list_streams().await.len(), 3);

    orchestrator.shutdown().await;
}

/// A source that dies (reader task exits) after its single frame, every
/// time it is (re)opened — a deterministic stand-in for killing the
/// worker process: `WorkerProcessHandle::is_alive()` goes false as soon
/// as the reader task returns, which is exactly what a crashed OS process
/// would look like from the orchestrator's point of view.
fn crash_prone_deps() -> WorkerDeps {
    WorkerDeps {
        frame_source_factory: Arc::new(SyntheticFrameSourceFactory {
            fps: 30.0,
            local: true,
            frame_count: Some(1),
        }),
        detector: Arc::new(NullDetector),
        event_bus: Arc::new(InProcEventBus::new(16)),
        encoder_launcher: Arc::new(NullLauncher),
    }
}

#[tokio::test(start_paused = true)]
async fn crash_then_restart_increments_restart_count() {
    let mut config = config_with(4, Duration::from_millis(20));
    config.initial_backoff = Duration::from_millis(10);
    config.max_backoff = Duration::from_millis(200);
    let orchestrator = Orchestrator::new(config, crash_prone_deps());

    let cfg = StreamConfig::new("crash", "/var/media/clip.mp4", false).unwrap();
    orchestrator.start_stream(cfg).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = orchestrator.get_stream("crash").await.unwrap();
    assert!(snapshot.restart_count >= 1, "expected at least one restart after the first crash");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = orchestrator.get_stream("crash").await.unwrap();
    assert!(snapshot.restart_count >= 2, "expected a second restart after backoff doubles");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn concurrent_starts_on_distinct_ids_all_succeed_under_capacity() {
    let config = config_with(8, Duration::from_secs(3600));
    let orchestrator = Orchestrator::new(config, remote_deps());

    let mut handles = Vec::new();
    for i in 0..6 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let cfg = StreamConfig::new(format!("cam-{i}"), "rtsp://host/live", false).unwrap();
            orchestrator.start_stream(cfg).await
        }));
    }

    let mut ok_count = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok_count += 1;
        }
    }
    assert_eq!(ok_count, 6);
    assert_eq!(orchestrator.list_streams().await.len(), 6);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn concurrent_starts_exceeding_capacity_admit_exactly_the_cap() {
    let config = config_with(3, Duration::from_secs(3600));
    let orchestrator = Orchestrator::new(config, remote_deps());

    let mut handles = Vec::new();
    for i in 0..8 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let cfg = StreamConfig::new(format!("cam-{i}"), "rtsp://host/live", false).unwrap();
            orchestrator.start_stream(cfg).await
        }));
    }

    let mut ok_count = 0;
    let mut capacity_exceeded_count = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok_count += 1,
            Err(OrchestratorError::CapacityExceeded) => capacity_exceeded_count += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok_count, 3);
    assert_eq!(capacity_exceeded_count, 5);
    assert_eq!(orchestrator.list_streams().await.len(), 3);

    orchestrator.shutdown().await;
}
