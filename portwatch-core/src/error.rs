use thiserror::Error;

/// Synchronous, caller-visible error kinds for the orchestrator's control
/// API. Runtime-loop failures (source open/read, publish, encoder) are
/// handled locally by their owning loop and never surface as this type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("invalid stream config: {0}")]
    ValidationError(String),

    #[error("stream '{0}' is already running")]
    AlreadyRunning(String),

    #[error("stream '{0}' not found")]
    NotFound(String),

    #[error("worker capacity exceeded (max_workers reached)")]
    CapacityExceeded,

    #[error("failed to spawn worker for stream '{stream_id}': {reason}")]
    WorkerSpawnFailure { stream_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
