//! Per-stream supervisory record and its read-only snapshot.
//! `WorkerHandle` is mutable and owned exclusively by the orchestrator's
//! control state; `HandleSnapshot` is what callers and the watchdog
//! actually see.

use std::sync::Arc;
use std::time::{Duration, Instant};

use portwatch_core::{BusMessage, StreamConfig, StreamId};

use crate::media::MediaPublisher;
use crate::queue::DropOldestQueue;
use crate::worker::WorkerProcessHandle;

/// Mutable per-stream supervisory record owned exclusively by the
/// orchestrator. Monotonic timestamp fields that can be unset use
/// `Option<Instant>`, with `None` playing the role of a sentinel zero.
pub struct WorkerHandle {
    /// Bumped every time a handle is (re)created for a stream id. Lets
    /// the watchdog detect "this handle was replaced mid-tick" by
    /// identity rather than by address: if the current handle's
    /// generation no longer matches the snapshot taken at the top of the
    /// tick, the planned restart is abandoned.
    pub generation: u64,
    pub config: StreamConfig,
    pub worker_process: WorkerProcessHandle,
    pub media_publisher: Arc<MediaPublisher>,
    pub detection_out: Arc<DropOldestQueue<BusMessage>>,
    pub started_at: Instant,
    pub last_heartbeat: Instant,
    pub restart_count: u32,
    pub last_exitcode: Option<i32>,
    pub backoff_seconds: f64,
    pub next_restart_at: Option<Instant>,
    pub viewer_count: u32,
    pub no_viewer_since: Option<Instant>,
}

impl WorkerHandle {
    pub fn is_alive(&self) -> bool {
        self.worker_process.is_alive()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_heartbeat = now;
    }

    pub fn acquire_viewer(&mut self, now: Instant) {
        self.viewer_count += 1;
        self.no_viewer_since = None;
        self.last_heartbeat = now;
    }

    /// Floors at zero; transitions `no_viewer_since` to `now` only on the
    /// edge into zero.
    pub fn release_viewer(&mut self, now: Instant) {
        if self.viewer_count > 0 {
            self.viewer_count -= 1;
        }
        if self.viewer_count == 0 {
            self.no_viewer_since.get_or_insert(now);
        }
    }

    pub fn snapshot(&self, stream_id: &StreamId) -> HandleSnapshot {
        HandleSnapshot {
            generation: self.generation,
            stream_id: stream_id.clone(),
            source_url: self.config.source_url().to_string(),
            loop_playback: self.config.loop_playback,
            is_alive: self.is_alive(),
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat,
            restart_count: self.restart_count,
            last_exitcode: self.last_exitcode,
            backoff_seconds: self.backoff_seconds,
            viewer_count: self.viewer_count,
            no_viewer_since: self.no_viewer_since,
            media_publisher_disabled: self.media_publisher.is_disabled(),
        }
    }
}

/// Read-only view of a `WorkerHandle` returned by the orchestrator's
/// public API.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSnapshot {
    pub generation: u64,
    pub stream_id: StreamId,
    pub source_url: String,
    pub loop_playback: bool,
    pub is_alive: bool,
    pub started_at: Instant,
    pub last_heartbeat: Instant,
    pub restart_count: u32,
    pub last_exitcode: Option<i32>,
    pub backoff_seconds: f64,
    pub viewer_count: u32,
    pub no_viewer_since: Option<Instant>,
    pub media_publisher_disabled: bool,
}

impl HandleSnapshot {
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn no_viewer_for(&self, now: Instant) -> Option<Duration> {
        self.no_viewer_since.map(|since| now.saturating_duration_since(since))
    }
}
