//! Lifecycle and checkpoint events.
//!
//! Sinks are injected where they are needed; there is no process-wide
//! default sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A step entered `setup`.
pub const STEP_STARTED: &str = "step.started";
/// A step moved to a new lifecycle state.
pub const STEP_PHASE: &str = "step.phase";
/// A step reached `persisted`.
pub const STEP_COMPLETED: &str = "step.completed";
/// A step reached `failed`.
pub const STEP_FAILED: &str = "step.failed";
/// An optional step failed and the driver moved on.
pub const STEP_SKIPPED: &str = "step.skipped";
/// A download batch was flushed and its ledger persisted.
pub const DOWNLOAD_CHECKPOINT: &str = "download.checkpoint";
/// The downloader switched to another egress path.
pub const DOWNLOAD_ROTATED: &str = "download.rotated";
