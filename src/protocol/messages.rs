//! Protocol message schemas.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::SteeringState;
use crate::task::{ExecutionSpec, Group, TaskMode};

/// Phase of the sandbox agent's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// Agent process started, manifest not yet read.
    #[default]
    Idle,
    /// Manifest read, preparing the workspace.
    Initializing,
    /// Cloning group repositories.
    Cloning,
    /// Executor invocation in flight.
    Executing,
    /// Verifier commands in flight.
    Verifying,
    /// Pipeline done, waiting for a human decision.
    AwaitingInput,
    /// Creating pull requests or collecting the report.
    Finalizing,
    /// Terminal: finalization done.
    Complete,
    /// Terminal: unrecoverable error, diagnostics in the result file.
    Failed,
    /// Terminal: rejected or cancelled from `awaiting_input`.
    Cancelled,
}

impl AgentPhase {
    /// True for phases the agent never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentPhase::Complete | AgentPhase::Failed | AgentPhase::Cancelled
        )
    }
}

/// Full description of a group's work, written once per sandbox by the
/// controller before the agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Task this group belongs to.
    pub task_id: String,
    /// The group, including its repositories.
    pub group: Group,
    /// Transform or report.
    pub mode: TaskMode,
    /// Executor specification.
    pub spec: ExecutionSpec,
    /// Wall-clock timeout the agent enforces on itself.
    pub timeout: Duration,
    /// Whether to stop in `awaiting_input` before finalizing.
    pub require_approval: bool,
    /// Cap on steering iterations.
    pub max_steering_iterations: u32,
}

/// Agent status, overwritten frequently while the pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    /// Current phase.
    pub phase: AgentPhase,
    /// Human-readable description of the current step.
    pub step: String,
    /// Repositories fully processed so far.
    pub repos_done: usize,
    /// Total repositories in the group.
    pub repos_total: usize,
    /// Steering iterations applied so far.
    pub steering_iteration: u32,
    /// Set when the latest instruction was rejected (iteration cap).
    #[serde(default)]
    pub rejected_instruction: Option<String>,
    /// RFC 3339 timestamp of this update.
    pub updated_at: String,
}

impl StatusFile {
    /// Creates a status stamped with the current time.
    pub fn now(phase: AgentPhase, step: impl Into<String>) -> Self {
        Self {
            phase,
            step: step.into(),
            repos_done: 0,
            repos_total: 0,
            steering_iteration: 0,
            rejected_instruction: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Sets the repo progress counters.
    pub fn with_repo_progress(mut self, done: usize, total: usize) -> Self {
        self.repos_done = done;
        self.repos_total = total;
        self
    }

    /// Sets the steering iteration counter.
    pub fn with_steering_iteration(mut self, iteration: u32) -> Self {
        self.steering_iteration = iteration;
        self
    }

    /// Marks the latest instruction as rejected with a reason.
    pub fn with_rejected_instruction(mut self, reason: impl Into<String>) -> Self {
        self.rejected_instruction = Some(reason.into());
        self
    }
}

/// Per-file change statistics, numstat style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path relative to the repository root.
    pub path: String,
    /// Lines added.
    pub additions: u32,
    /// Lines removed.
    pub deletions: u32,
}

/// A commit made inside the sandbox clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Commit hash.
    pub hash: String,
    /// Commit message.
    pub message: String,
}

/// Outcome of one verifier command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierOutcome {
    /// The command that ran.
    pub command: String,
    /// Exit code (None when the process was killed by a signal).
    pub exit_code: Option<i32>,
    /// Captured stdout + stderr.
    pub output: String,
}

impl VerifierOutcome {
    /// True when the verifier exited zero.
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Result for a single repository in the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoResult {
    /// Repository name from the manifest.
    pub repo: String,
    /// Unified diff of the working tree against the base revision.
    #[serde(default)]
    pub diff: String,
    /// Per-file change statistics.
    #[serde(default)]
    pub files_changed: Vec<FileDiff>,
    /// Commits made in the sandbox clone.
    #[serde(default)]
    pub commits: Vec<CommitRecord>,
    /// Verifier outcomes, one per configured verifier.
    #[serde(default)]
    pub verifier_outcomes: Vec<VerifierOutcome>,
    /// Finalization artifact (PR URL for transform, report ref for report).
    #[serde(default)]
    pub artifact: Option<String>,
    /// Structured report payload for report mode.
    #[serde(default)]
    pub report: Option<serde_json::Value>,
    /// Diagnostic when this repository's pipeline failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl RepoResult {
    /// Creates an empty result for the named repository.
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            diff: String::new(),
            files_changed: Vec::new(),
            commits: Vec::new(),
            verifier_outcomes: Vec::new(),
            artifact: None,
            report: None,
            error: None,
        }
    }

    /// True when every verifier passed and no error was recorded.
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.verifier_outcomes.iter().all(VerifierOutcome::passed)
    }
}

/// Structured results, overwritten by the agent at phase boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultFile {
    /// Task this result belongs to.
    pub task_id: String,
    /// Group name.
    pub group: String,
    /// Per-repository results.
    pub repos: Vec<RepoResult>,
    /// Raw executor output from the most recent invocation.
    #[serde(default)]
    pub raw_output: String,
    /// Steering bookkeeping, including the full iteration history.
    pub steering: SteeringState,
}

impl ResultFile {
    /// Finalization artifacts across all repositories.
    pub fn artifacts(&self) -> Vec<String> {
        self.repos
            .iter()
            .filter_map(|r| r.artifact.clone())
            .collect()
    }
}

/// A human decision relayed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SteeringAction {
    /// Apply a mid-flight correction and re-run the pipeline.
    Steer { prompt: String },
    /// Proceed to finalization.
    Approve,
    /// Discard the work, no finalization.
    Reject,
    /// Discard the work, no finalization.
    Cancel,
}

/// Instruction file written by the controller, deleted by the agent on
/// consumption.
///
/// `seq` totally orders instructions: an agent never acts on an
/// instruction older than the latest one it has seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteeringInstruction {
    /// Monotonically increasing sequence number, per group.
    pub seq: u64,
    /// The decision.
    #[serde(flatten)]
    pub action: SteeringAction,
}

impl SteeringInstruction {
    /// Creates an instruction with the given sequence number.
    pub fn new(seq: u64, action: SteeringAction) -> Self {
        Self { seq, action }
    }
}
