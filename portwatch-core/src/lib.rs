//! Domain types shared by the portwatch orchestrator and worker runtime.
//!
//! This crate carries no process/task machinery of its own: it is the
//! vocabulary (`StreamConfig`, error kinds, bus wire payloads, environment
//! configuration) that `portwatch-runtime` and `portwatch-server` build on.

pub mod config;
pub mod error;
pub mod events;
pub mod stream;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use events::{
    BusMessage, DetectedVessel, Detection, DetectionPayload, FrameMetaPayload, ReadyPayload,
};
pub use stream::{StreamConfig, StreamId};
