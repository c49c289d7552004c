//! Error types for the armada orchestrator.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for orchestration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Sandbox never became reachable.
    #[error("sandbox provisioning failed for group {group}: {reason}")]
    Provisioning { group: String, reason: String },

    /// Clone, transform, or verify error inside the pipeline.
    #[error("pipeline failed: {0}")]
    Pipeline(String),

    /// Task wall-clock timeout exceeded, enforced by the agent.
    #[error("task timed out after {0} seconds")]
    Timeout(u64),

    /// Steering iteration cap hit. A rejected instruction, not a failure.
    #[error("steering iteration limit reached ({current} of {max})")]
    IterationLimitReached { current: u32, max: u32 },

    /// Controller gave up waiting on an unresponsive sandbox.
    #[error("sandbox for group {group} went stale: no status update for {idle_secs} seconds")]
    Staleness { group: String, idle_secs: u64 },

    /// Explicit reject/cancel, or the inactivity window expired.
    #[error("cancelled by human decision: {0}")]
    HumanCancelled(String),

    /// Failed to tear down a sandbox.
    #[error("failed to clean up sandbox at {path}: {reason}")]
    SandboxCleanup { path: PathBuf, reason: String },

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error during sandbox or protocol operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol file could not be serialized or parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Task or manifest configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Finalization (PR creation / report collection) failed.
    #[error("finalization failed: {0}")]
    Finalize(String),
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;
