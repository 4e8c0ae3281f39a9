//! Authoritative registry of streams and worker supervision. A single
//! async mutex guards the handle/config maps and every mutating field of
//! `WorkerHandle`, in place of a dedicated control task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use portwatch_core::{OrchestratorConfig, OrchestratorError, Result, StreamConfig, StreamId};

use crate::registry::{HandleSnapshot, WorkerHandle};
use crate::watchdog;
use crate::worker::{self, StopSignal, WorkerDeps};

/// Process termination escalation timeouts: graceful signal, wait up to
/// 5s, then force-kill.
pub(crate) const GRACEFUL_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct OrchestratorState {
    pub(crate) handles: HashMap<StreamId, WorkerHandle>,
    pub(crate) configs: HashMap<StreamId, StreamConfig>,
    next_generation: u64,
}

impl OrchestratorState {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            configs: HashMap::new(),
            next_generation: 0,
        }
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Authoritative lifecycle owner for every stream. Cloning shares the
/// same underlying state and watchdog, the way `ferrex-server`'s
/// `TranscodingService` handles are cloned.
#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<Mutex<OrchestratorState>>,
    deps: Arc<WorkerDeps>,
    config: Arc<OrchestratorConfig>,
    watchdog_stop: StopSignal,
    watchdog_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, deps: WorkerDeps) -> Self {
        let state = Arc::new(Mutex::new(OrchestratorState::new()));
        let config = Arc::new(config);
        let deps = Arc::new(deps);
        let watchdog_stop = StopSignal::new();

        let watchdog_handle = tokio::spawn(watchdog::run(
            state.clone(),
            config.clone(),
            deps.clone(),
            watchdog_stop.clone(),
        ));

        Self {
            state,
            deps,
            config,
            watchdog_stop,
            watchdog_handle: Arc::new(Mutex::new(Some(watchdog_handle))),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn start_stream(&self, config: StreamConfig) -> Result<HandleSnapshot> {
        let stream_id = config.stream_id().to_string();
        {
            let state = self.state.lock().await;
            if state.handles.contains_key(&stream_id) {
                return Err(OrchestratorError::AlreadyRunning(stream_id));
            }
            if state.handles.len() >= self.config.max_workers {
                return Err(OrchestratorError::CapacityExceeded);
            }
        }

        let spawned = worker::spawn(&config, &self.deps, &self.config).await;
        let now = Instant::now();

        let mut state = self.state.lock().await;
        if state.handles.contains_key(&stream_id) {
            let handle = build_handle(&mut state, config.clone(), spawned, now, 1, None);
            drop(state);
            self.terminate_and_teardown(&stream_id, handle).await;
            return Err(OrchestratorError::AlreadyRunning(stream_id));
        }
        if state.handles.len() >= self.config.max_workers {
            let handle = build_handle(&mut state, config.clone(), spawned, now, 1, None);
            drop(state);
            self.terminate_and_teardown(&stream_id, handle).await;
            return Err(OrchestratorError::CapacityExceeded);
        }

        let handle = build_handle(&mut state, config.clone(), spawned, now, 0, Some(now));
        let snapshot = handle.snapshot(&stream_id);
        state.configs.insert(stream_id.clone(), config);
        state.handles.insert(stream_id, handle);
        Ok(snapshot)
    }

    pub async fn stop_stream(&self, stream_id: &str, remove_config: bool) -> Result<()> {
        let handle = {
            let mut state = self.state.lock().await;
            let handle = state
                .handles
                .remove(stream_id)
                .ok_or_else(|| OrchestratorError::NotFound(stream_id.to_string()))?;
            if remove_config {
                state.configs.remove(stream_id);
            }
            handle
        };
        self.terminate_and_teardown(stream_id, handle).await;
        Ok(())
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<HandleSnapshot> {
        let state = self.state.lock().await;
        state
            .handles
            .get(stream_id)
            .map(|handle| handle.snapshot(&stream_id.to_string()))
            .ok_or_else(|| OrchestratorError::NotFound(stream_id.to_string()))
    }

    pub async fn list_streams(&self) -> Vec<HandleSnapshot> {
        let state = self.state.lock().await;
        state
            .handles
            .iter()
            .map(|(stream_id, handle)| handle.snapshot(stream_id))
            .collect()
    }

    /// Increments `viewer_count` on a running handle, or hot-restarts a
    /// worker from a retained config if none is running.
    /// The whole decision is made under the registry lock, which is what
    /// resolves the race against the watchdog's no-viewer stop in favor
    /// of whichever actually holds the lock first.
    pub async fn acquire_stream_viewer(&self, stream_id: &str) -> Result<HandleSnapshot> {
        let now = Instant::now();
        {
            let mut state = self.state.lock().await;
            if let Some(handle) = state.handles.get_mut(stream_id) {
                handle.acquire_viewer(now);
                return Ok(handle.snapshot(&stream_id.to_string()));
            }
        }

        let config = {
            let state = self.state.lock().await;
            state.configs.get(stream_id).cloned()
        };
        let Some(config) = config else {
            return Err(OrchestratorError::NotFound(stream_id.to_string()));
        };

        {
            let state = self.state.lock().await;
            if state.handles.len() >= self.config.max_workers {
                return Err(OrchestratorError::CapacityExceeded);
            }
        }

        let spawned = worker::spawn(&config, &self.deps, &self.config).await;

        let mut state = self.state.lock().await;
        if let Some(existing) = state.handles.get_mut(stream_id) {
            existing.acquire_viewer(now);
            let snapshot = existing.snapshot(&stream_id.to_string());
            let handle = build_handle(&mut state, config, spawned, now, 1, None);
            drop(state);
            self.terminate_and_teardown(stream_id, handle).await;
            return Ok(snapshot);
        }
        if state.handles.len() >= self.config.max_workers {
            let handle = build_handle(&mut state, config, spawned, now, 1, None);
            drop(state);
            self.terminate_and_teardown(stream_id, handle).await;
            return Err(OrchestratorError::CapacityExceeded);
        }

        let handle = build_handle(&mut state, config, spawned, now, 1, None);
        let snapshot = handle.snapshot(&stream_id.to_string());
        state.handles.insert(stream_id.to_string(), handle);
        Ok(snapshot)
    }

    /// Always succeeds, even for an unknown `stream_id`.
    pub async fn release_stream_viewer(&self, stream_id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(handle) = state.handles.get_mut(stream_id) {
            handle.release_viewer(now);
        }
    }

    /// Always succeeds, even for an unknown `stream_id`.
    pub async fn touch_stream(&self, stream_id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(handle) = state.handles.get_mut(stream_id) {
            handle.touch(now);
        }
    }

    /// Stops the watchdog, then terminates every worker. Idempotent: a
    /// second call finds nothing left to do.
    pub async fn shutdown(&self) {
        self.watchdog_stop.stop();
        if let Some(handle) = self.watchdog_handle.lock().await.take() {
            let _ = handle.await;
        }

        let drained: Vec<(StreamId, WorkerHandle)> = {
            let mut state = self.state.lock().await;
            state.handles.drain().collect()
        };
        for (stream_id, handle) in drained {
            self.terminate_and_teardown(&stream_id, handle).await;
        }
        info!("orchestrator shutdown complete");
    }

    pub(crate) async fn terminate_and_teardown(&self, stream_id: &str, handle: WorkerHandle) {
        let WorkerHandle {
            worker_process,
            media_publisher,
            detection_out,
            ..
        } = handle;
        worker_process.terminate(GRACEFUL_TERMINATE_TIMEOUT).await;
        worker::teardown(stream_id, &media_publisher, self.deps.event_bus.as_ref(), &detection_out).await;
    }
}

fn build_handle(
    state: &mut OrchestratorState,
    config: StreamConfig,
    spawned: crate::worker::SpawnedWorker,
    now: Instant,
    viewer_count: u32,
    no_viewer_since: Option<Instant>,
) -> WorkerHandle {
    WorkerHandle {
        generation: state.next_generation(),
        config,
        worker_process: spawned.process,
        media_publisher: spawned.media_publisher,
        detection_out: spawned.detection_out,
        started_at: now,
        last_heartbeat: now,
        restart_count: 0,
        last_exitcode: None,
        backoff_seconds: 0.0,
        next_restart_at: None,
        viewer_count,
        no_viewer_since,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcEventBus;
    use crate::detector::NullDetector;
    use crate::frame::SyntheticFrameSourceFactory;
    use crate::media::{EncoderExit, EncoderLauncher, EncoderProcess, PublishMode, SpawnError};
    use crate::frame::Frame;
    use async_trait::async_trait;

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

    fn test_deps() -> WorkerDeps {
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

    fn test_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.max_workers = 2;
        config.watchdog_period = Duration::from_secs(3600);
        config
    }

    #[tokio::test]
    async fn start_stream_rejects_duplicate() {
        let orchestrator = Orchestrator::new(test_config(), test_deps());
        let cfg = StreamConfig::new("cam-1", "rtsp://host/live", false).unwrap();
        orchestrator.start_stream(cfg.clone()).await.unwrap();
        let err = orchestrator.start_stream(cfg).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning(_)));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn start_stream_enforces_capacity() {
        let orchestrator = Orchestrator::new(test_config(), test_deps());
        for i in 0..2 {
            let cfg = StreamConfig::new(format!("cam-{i}"), "rtsp://host/live", false).unwrap();
            orchestrator.start_stream(cfg).await.unwrap();
        }
        let cfg = StreamConfig::new("cam-overflow", "rtsp://host/live", false).unwrap();
        let err = orchestrator.start_stream(cfg).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CapacityExceeded));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn stop_stream_twice_returns_not_found_second_time() {
        let orchestrator = Orchestrator::new(test_config(), test_deps());
        let cfg = StreamConfig::new("cam-1", "rtsp://host/live", false).unwrap();
        orchestrator.start_stream(cfg).await.unwrap();
        orchestrator.stop_stream("cam-1", true).await.unwrap();
        let err = orchestrator.stop_stream("cam-1", true).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn release_viewer_never_goes_negative() {
        let orchestrator = Orchestrator::new(test_config(), test_deps());
        let cfg = StreamConfig::new("cam-1", "rtsp://host/live", false).unwrap();
        orchestrator.start_stream(cfg).await.unwrap();
        for _ in 0..5 {
            orchestrator.release_stream_viewer("cam-1").await;
        }
        let snapshot = orchestrator.get_stream("cam-1").await.unwrap();
        assert_eq!(snapshot.viewer_count, 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn release_viewer_on_unknown_stream_is_a_noop() {
        let orchestrator = Orchestrator::new(test_config(), test_deps());
        orchestrator.release_stream_viewer("ghost").await;
        orchestrator.touch_stream("ghost").await;
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn hot_restart_on_acquire_after_no_viewer_stop() {
        let orchestrator = Orchestrator::new(test_config(), test_deps());
        let cfg = StreamConfig::new("cam-1", "rtsp://host/live", false).unwrap();
        orchestrator.start_stream(cfg).await.unwrap();
        orchestrator.stop_stream("cam-1", false).await.unwrap();
        assert!(orchestrator.get_stream("cam-1").await.is_err());

        let snapshot = orchestrator.acquire_stream_viewer("cam-1").await.unwrap();
        assert_eq!(snapshot.viewer_count, 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let orchestrator = Orchestrator::new(test_config(), test_deps());
        orchestrator.shutdown().await;
        orchestrator.shutdown().await;
    }
}
