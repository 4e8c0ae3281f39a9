//! Worker orchestration runtime for the stream analytics backend:
//! per-stream worker pool, watchdog supervision, frame/detector
//! collaborator traits, media publisher, and event bus adapter.
//!
//! `portwatch-core` carries the vocabulary; this crate carries the task
//! machinery that vocabulary gets pushed through.

mod queue;
mod frame;
mod detector;
pub mod bus;
pub mod media;
pub mod worker;
mod registry;
mod orchestrator;
mod watchdog;

pub use detector::{Detector, NullDetector, SyntheticDetector};
pub use frame::{
    DecodeOutcome, Frame, FrameSource, FrameSourceFactory, SyntheticFrameSource,
    SyntheticFrameSourceFactory,
};
pub use orchestrator::Orchestrator;
pub use queue::{DropOldestQueue, SharedQueue};
pub use registry::HandleSnapshot;
pub use worker::WorkerDeps;
