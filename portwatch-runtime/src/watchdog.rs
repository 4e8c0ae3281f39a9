//! Single supervisor loop: idle timeout, no-viewer timeout, liveness +
//! backoff restart. Runs as its own task, spawned by `Orchestrator::new`
//! and stopped by `Orchestrator::shutdown`.
//!
//! Note on "spawn failure": this runtime models a worker as a pair of
//! tokio tasks sharing a stop signal rather than a forked OS process, so
//! `worker::spawn` has no synchronous failure mode the way `fork()`/exec
//! would. An unopenable source instead manifests as the reader task
//! exiting almost immediately, which this loop's liveness check picks up
//! on the very next tick and retries with the same backoff schedule used
//! for any other restart.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};

use portwatch_core::{OrchestratorConfig, StreamId};

use crate::orchestrator::{GRACEFUL_TERMINATE_TIMEOUT, OrchestratorState};
use crate::registry::WorkerHandle;
use crate::worker::{self, StopSignal, WorkerDeps};

pub async fn run(
    state: Arc<Mutex<OrchestratorState>>,
    config: Arc<OrchestratorConfig>,
    deps: Arc<WorkerDeps>,
    stop: StopSignal,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.watchdog_period) => {}
            _ = stop.wait_for_stop() => return,
        }
        tick(&state, &config, &deps).await;
    }
}

async fn tick(state: &Arc<Mutex<OrchestratorState>>, config: &OrchestratorConfig, deps: &WorkerDeps) {
    let now = Instant::now();

    // Snapshot the handle set under the lock; a handle removed during
    // this tick is skipped for subsequent steps.
    let snapshot: Vec<(StreamId, u64)> = {
        let state = state.lock().await;
        state
            .handles
            .iter()
            .map(|(stream_id, handle)| (stream_id.clone(), handle.generation))
            .collect()
    };

    for (stream_id, generation) in snapshot {
        if idle_timeout_due(state, config, &stream_id, generation, now).await {
            stop_and_teardown(state, deps, &stream_id, true).await;
            continue;
        }
        if no_viewer_timeout_due(state, config, &stream_id, generation, now).await {
            stop_and_teardown(state, deps, &stream_id, false).await;
            continue;
        }
        check_liveness(state, config, deps, &stream_id, generation, now).await;
    }
}

async fn idle_timeout_due(
    state: &Arc<Mutex<OrchestratorState>>,
    config: &OrchestratorConfig,
    stream_id: &str,
    generation: u64,
    now: Instant,
) -> bool {
    let state = state.lock().await;
    match state.handles.get(stream_id) {
        Some(handle) if handle.generation == generation => {
            !config.is_protected(stream_id)
                && !config.idle_timeout.is_zero()
                && now.saturating_duration_since(handle.last_heartbeat) > config.idle_timeout
        }
        _ => false,
    }
}

async fn no_viewer_timeout_due(
    state: &Arc<Mutex<OrchestratorState>>,
    config: &OrchestratorConfig,
    stream_id: &str,
    generation: u64,
    now: Instant,
) -> bool {
    let state = state.lock().await;
    match state.handles.get(stream_id) {
        Some(handle) if handle.generation == generation => {
            !config.is_protected(stream_id)
                && !config.no_viewer_timeout.is_zero()
                && handle.viewer_count == 0
                && handle
                    .no_viewer_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= config.no_viewer_timeout)
        }
        _ => false,
    }
}

async fn stop_and_teardown(
    state: &Arc<Mutex<OrchestratorState>>,
    deps: &WorkerDeps,
    stream_id: &str,
    remove_config: bool,
) {
    let handle = {
        let mut state = state.lock().await;
        let handle = state.handles.remove(stream_id);
        if remove_config {
            state.configs.remove(stream_id);
        }
        handle
    };
    if let Some(handle) = handle {
        debug!(stream_id, remove_config, "watchdog stopping worker");
        terminate_and_teardown(deps, stream_id, handle).await;
    }
}

async fn terminate_and_teardown(deps: &WorkerDeps, stream_id: &str, handle: WorkerHandle) {
    let WorkerHandle {
        worker_process,
        media_publisher,
        detection_out,
        ..
    } = handle;
    worker_process.terminate(GRACEFUL_TERMINATE_TIMEOUT).await;
    worker::teardown(stream_id, &media_publisher, deps.event_bus.as_ref(), &detection_out).await;
}

/// Liveness check and backoff-driven restart.
async fn check_liveness(
    state: &Arc<Mutex<OrchestratorState>>,
    config: &OrchestratorConfig,
    deps: &WorkerDeps,
    stream_id: &str,
    generation: u64,
    now: Instant,
) {
    let restart_config = {
        let mut state_guard = state.lock().await;
        let Some(handle) = state_guard.handles.get_mut(stream_id) else {
            return;
        };
        if handle.generation != generation {
            return;
        }

        if handle.is_alive() {
            handle.backoff_seconds = config.initial_backoff.as_secs_f64();
            handle.next_restart_at = None;
            return;
        }

        match handle.next_restart_at {
            None => {
                if handle.backoff_seconds <= 0.0 {
                    handle.backoff_seconds = config.initial_backoff.as_secs_f64();
                }
                handle.next_restart_at = Some(now + Duration::from_secs_f64(handle.backoff_seconds));
                return;
            }
            Some(next_restart_at) if now < next_restart_at => return,
            Some(_) => handle.config.clone(),
        }
    };

    let spawned = worker::spawn(&restart_config, deps, config).await;

    let mut state_guard = state.lock().await;
    let Some(handle) = state_guard.handles.get_mut(stream_id) else {
        drop(state_guard);
        info!(stream_id, "handle vanished during restart spawn, abandoning");
        let orphan = orphan_handle(restart_config, spawned, now);
        terminate_and_teardown(deps, stream_id, orphan).await;
        return;
    };
    if handle.generation != generation {
        drop(state_guard);
        info!(stream_id, "handle replaced mid-tick, abandoning planned restart");
        let orphan = orphan_handle(restart_config, spawned, now);
        terminate_and_teardown(deps, stream_id, orphan).await;
        return;
    }

    let old_media_publisher = std::mem::replace(&mut handle.media_publisher, spawned.media_publisher);
    let old_detection_out = std::mem::replace(&mut handle.detection_out, spawned.detection_out);
    handle.worker_process = spawned.process;
    handle.restart_count += 1;
    handle.backoff_seconds = (handle.backoff_seconds * 2.0).min(config.max_backoff.as_secs_f64());
    handle.next_restart_at = None;
    drop(state_guard);

    worker::teardown(stream_id, &old_media_publisher, deps.event_bus.as_ref(), &old_detection_out).await;
    info!(stream_id, "watchdog restarted worker");
}

fn orphan_handle(
    config: portwatch_core::StreamConfig,
    spawned: crate::worker::SpawnedWorker,
    now: Instant,
) -> WorkerHandle {
    WorkerHandle {
        generation: 0,
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
        viewer_count: 0,
        no_viewer_since: None,
    }
}
