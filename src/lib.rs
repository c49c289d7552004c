//! Armada - fleet-wide code transformation orchestrator.
//!
//! This library drives long-running transformation tasks across many
//! repositories: a durable task controller provisions one sandbox per
//! group, a sandbox agent runs each group's pipeline autonomously, and
//! the two communicate through an atomic file-exchange protocol that
//! survives controller crashes and unbounded human review latency.

pub mod agent;
pub mod backoff;
pub mod controller;
pub mod error;
pub mod executor;
pub mod finalize;
pub mod git;
pub mod notify;
pub mod progress;
pub mod protocol;
pub mod sandbox;
pub mod substrate;
pub mod task;
pub mod verifier;

pub use agent::{AgentConfig, SandboxAgent};
pub use backoff::ExponentialBackoff;
pub use controller::{ControllerConfig, TaskController};
pub use error::{Error, Result};
pub use executor::{
    executor_for_spec, AgentCliExecutor, CommandExecutor, ContextTurn, ExecutorOutcome,
    ExecutorRequest, TransformExecutor,
};
pub use finalize::{collect_report, generate_pr_body, Finalizer, PullRequestFinalizer, RepoWorkspace};
pub use notify::{notify_best_effort, LogNotifier, Notifier, NotifyEvent};
pub use progress::{ExecutionProgress, SteeringIteration, SteeringState};
pub use protocol::{
    AgentPhase, CommitRecord, FileDiff, Manifest, ProtocolStore, RepoResult, ResultFile,
    StatusFile, SteeringAction, SteeringInstruction, VerifierOutcome,
};
pub use sandbox::{
    LocalSandbox, LocalSandboxProvider, ResourceSpec, SandboxHandle, SandboxProvider,
};
pub use substrate::{
    GroupSnapshot, HumanDecision, InProcessSubstrate, PauseDecision, Substrate,
};
pub use task::{
    ExecutionSpec, FailureAction, FailurePolicy, Group, GroupOutcome, GroupStatus, RepoSpec, Task,
    TaskMode, TaskResult, TaskStatus,
};
pub use verifier::VerifierRunner;
