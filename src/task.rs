//! Task and group representation for fleet transformation runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mode of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Apply a transformation and open pull requests.
    #[default]
    Transform,
    /// Collect a structured report per repository, no code changes land.
    Report,
}

/// What the sandbox agent runs against each repository.
///
/// The controller and protocol are unaware of which variant is in use;
/// both are consumed through one executor call signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutionSpec {
    /// Agent-driven transformation from a natural-language instruction.
    Agentic {
        instruction: String,
        /// Verifier commands run after every executor invocation.
        #[serde(default)]
        verifiers: Vec<String>,
    },
    /// Fixed deterministic command.
    Deterministic { command: String },
}

impl ExecutionSpec {
    /// Returns the verifier commands for this spec.
    ///
    /// Deterministic runs are verified by their own exit status, so the
    /// list is empty for that variant.
    pub fn verifiers(&self) -> &[String] {
        match self {
            ExecutionSpec::Agentic { verifiers, .. } => verifiers,
            ExecutionSpec::Deterministic { .. } => &[],
        }
    }
}

/// What to do when the failure threshold is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    /// Stop launching new groups and wait for a human decision.
    Pause,
    /// Skip all not-yet-started groups immediately.
    Abort,
}

/// Threshold policy over the running failure percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Percentage (0-100) of failed-vs-completed groups that triggers `action`.
    pub threshold_percent: u8,
    /// Action taken when the threshold is strictly exceeded.
    pub action: FailureAction,
}

/// A repository targeted by a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Short name, used for branch naming and reporting.
    pub name: String,
    /// Clone URL.
    pub url: String,
    /// Commands run in the clone before the executor (e.g. dependency install).
    #[serde(default)]
    pub setup_commands: Vec<String>,
}

impl RepoSpec {
    /// Creates a repo spec with the given name and clone URL.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            setup_commands: Vec::new(),
        }
    }

    /// Adds setup commands run before the executor.
    pub fn with_setup_commands(mut self, commands: Vec<String>) -> Self {
        self.setup_commands = commands;
        self
    }
}

/// Status of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    /// Not yet launched.
    #[default]
    Pending,
    /// Bound to a sandbox and executing.
    Running,
    /// Reached a successful terminal state.
    Succeeded,
    /// Reached a failed terminal state.
    Failed,
    /// Never launched (threshold abort or skip-remaining).
    Skipped,
}

impl GroupStatus {
    /// True once the group ran to a terminal state (skipped groups never ran).
    pub fn is_completed(&self) -> bool {
        matches!(self, GroupStatus::Succeeded | GroupStatus::Failed)
    }

    /// True for any terminal state, including skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GroupStatus::Succeeded | GroupStatus::Failed | GroupStatus::Skipped
        )
    }
}

/// A named batch of repositories sharing one sandbox and one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name, unique within its task.
    pub name: String,
    /// Repositories processed together in this group's sandbox.
    pub repos: Vec<RepoSpec>,
}

impl Group {
    /// Creates a group with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repos: Vec::new(),
        }
    }

    /// Adds a repository to the group.
    pub fn with_repo(mut self, repo: RepoSpec) -> Self {
        self.repos.push(repo);
        self
    }
}

fn default_max_steering_iterations() -> u32 {
    5
}

fn default_max_parallel() -> usize {
    5
}

fn default_timeout() -> Duration {
    Duration::from_secs(3600)
}

/// One submitted unit of fleet-wide transformation or report work.
///
/// Immutable after creation; owned exclusively by the controller
/// instance executing it. Derive a retry task via [`Task::retry_failed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Transform (PRs) or report (structured collection).
    #[serde(default)]
    pub mode: TaskMode,
    /// Groups executed in parallel, one sandbox each.
    pub groups: Vec<Group>,
    /// Executor specification shared by every group.
    pub spec: ExecutionSpec,
    /// Wall-clock timeout per group, enforced by the agent itself.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    /// Whether each group stops for human approval before finalizing.
    #[serde(default)]
    pub require_approval: bool,
    /// Cap on mid-flight steering corrections per group.
    #[serde(default = "default_max_steering_iterations")]
    pub max_steering_iterations: u32,
    /// Cap on concurrently running groups.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Optional pause/abort policy over the running failure percentage.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    /// Id of the task this one retries, if derived via [`Task::retry_failed`].
    #[serde(default)]
    pub retry_of: Option<String>,
}

impl Task {
    /// Creates a task with a fresh id and the given executor spec.
    pub fn new(mode: TaskMode, spec: ExecutionSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            groups: Vec::new(),
            spec,
            timeout: default_timeout(),
            require_approval: false,
            max_steering_iterations: default_max_steering_iterations(),
            max_parallel: default_max_parallel(),
            failure_policy: None,
            retry_of: None,
        }
    }

    /// Adds a group.
    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    /// Sets the wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requires human approval before finalization.
    pub fn with_approval(mut self, require: bool) -> Self {
        self.require_approval = require;
        self
    }

    /// Sets the steering iteration cap.
    pub fn with_max_steering_iterations(mut self, max: u32) -> Self {
        self.max_steering_iterations = max;
        self
    }

    /// Sets the parallel group cap.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    /// Sets the failure threshold policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    /// Derives a retry task scoped to exactly the groups that failed.
    ///
    /// Returns `None` when the result has no failed groups. The derived
    /// task carries `retry_of` lineage and a fresh id; everything else is
    /// copied from this task.
    pub fn retry_failed(&self, result: &TaskResult) -> Option<Task> {
        let failed: Vec<&str> = result.failed_groups();
        if failed.is_empty() {
            return None;
        }

        let groups = self
            .groups
            .iter()
            .filter(|g| failed.contains(&g.name.as_str()))
            .cloned()
            .collect();

        Some(Task {
            id: Uuid::new_v4().to_string(),
            mode: self.mode,
            groups,
            spec: self.spec.clone(),
            timeout: self.timeout,
            require_approval: self.require_approval,
            max_steering_iterations: self.max_steering_iterations,
            max_parallel: self.max_parallel,
            failure_policy: self.failure_policy,
            retry_of: Some(self.id.clone()),
        })
    }
}

/// Terminal outcome of a single group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOutcome {
    /// Group name.
    pub group: String,
    /// Terminal status (`succeeded`, `failed`, or `skipped`).
    pub status: GroupStatus,
    /// Diagnostic string when the group failed.
    pub diagnostic: Option<String>,
    /// Finalization artifacts (PR URLs or report references).
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Wall-clock duration of the group's run.
    #[serde(default)]
    pub duration: Option<Duration>,
}

impl GroupOutcome {
    /// Creates a succeeded outcome.
    pub fn succeeded(group: impl Into<String>, artifacts: Vec<String>) -> Self {
        Self {
            group: group.into(),
            status: GroupStatus::Succeeded,
            diagnostic: None,
            artifacts,
            duration: None,
        }
    }

    /// Creates a failed outcome with a diagnostic.
    pub fn failed(group: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            status: GroupStatus::Failed,
            diagnostic: Some(diagnostic.into()),
            artifacts: Vec::new(),
            duration: None,
        }
    }

    /// Creates a skipped outcome.
    pub fn skipped(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            status: GroupStatus::Skipped,
            diagnostic: None,
            artifacts: Vec::new(),
            duration: None,
        }
    }
}

/// Overall terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// All groups reached a terminal state without task-level cancellation.
    /// Partial success (some failed or skipped groups) still completes.
    Completed,
    /// The task as a whole was cancelled by a human decision.
    Cancelled,
}

/// Terminal result of a task, one outcome per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the task this result belongs to.
    pub task_id: String,
    /// Overall terminal status.
    pub status: TaskStatus,
    /// Per-group outcomes, in completion order.
    pub outcomes: Vec<GroupOutcome>,
    /// Lineage: id of the task this run retried, if any.
    #[serde(default)]
    pub retry_of: Option<String>,
}

impl TaskResult {
    /// Names of groups that ended `failed`.
    pub fn failed_groups(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.status == GroupStatus::Failed)
            .map(|o| o.group.as_str())
            .collect()
    }

    /// Count of groups by terminal status.
    pub fn counts(&self) -> (usize, usize, usize) {
        let succeeded = self
            .outcomes
            .iter()
            .filter(|o| o.status == GroupStatus::Succeeded)
            .count();
        let failed = self
            .outcomes
            .iter()
            .filter(|o| o.status == GroupStatus::Failed)
            .count();
        let skipped = self
            .outcomes
            .iter()
            .filter(|o| o.status == GroupStatus::Skipped)
            .count();
        (succeeded, failed, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::new(
            TaskMode::Transform,
            ExecutionSpec::Agentic {
                instruction: "upgrade to the new logging API".to_string(),
                verifiers: vec!["cargo check".to_string()],
            },
        )
        .with_group(Group::new("batch-a").with_repo(RepoSpec::new("svc-a", "file:///repos/svc-a")))
        .with_group(Group::new("batch-b").with_repo(RepoSpec::new("svc-b", "file:///repos/svc-b")))
        .with_group(Group::new("batch-c").with_repo(RepoSpec::new("svc-c", "file:///repos/svc-c")))
    }

    #[test]
    fn task_builder_applies_defaults() {
        let task = sample_task();
        assert_eq!(task.max_steering_iterations, 5);
        assert_eq!(task.max_parallel, 5);
        assert!(!task.require_approval);
        assert!(task.failure_policy.is_none());
        assert!(task.retry_of.is_none());
    }

    #[test]
    fn execution_spec_serializes_with_kind_tag() {
        let spec = ExecutionSpec::Deterministic {
            command: "cargo fmt".to_string(),
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"deterministic\""));

        let back: ExecutionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn deterministic_spec_has_no_verifiers() {
        let spec = ExecutionSpec::Deterministic {
            command: "make migrate".to_string(),
        };
        assert!(spec.verifiers().is_empty());
    }

    #[test]
    fn retry_failed_scopes_to_failed_groups() {
        let task = sample_task();
        let result = TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Completed,
            outcomes: vec![
                GroupOutcome::succeeded("batch-a", vec![]),
                GroupOutcome::failed("batch-b", "verifier exited 1"),
                GroupOutcome::failed("batch-c", "clone failed"),
            ],
            retry_of: None,
        };

        let retry = task.retry_failed(&result).unwrap();
        let names: Vec<&str> = retry.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["batch-b", "batch-c"]);
        assert_eq!(retry.retry_of.as_deref(), Some(task.id.as_str()));
        assert_ne!(retry.id, task.id);
        assert_eq!(retry.max_parallel, task.max_parallel);
    }

    #[test]
    fn retry_failed_returns_none_without_failures() {
        let task = sample_task();
        let result = TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Completed,
            outcomes: vec![
                GroupOutcome::succeeded("batch-a", vec![]),
                GroupOutcome::skipped("batch-b"),
            ],
            retry_of: None,
        };
        assert!(task.retry_failed(&result).is_none());
    }

    #[test]
    fn group_status_completion_excludes_skipped() {
        assert!(GroupStatus::Succeeded.is_completed());
        assert!(GroupStatus::Failed.is_completed());
        assert!(!GroupStatus::Skipped.is_completed());
        assert!(GroupStatus::Skipped.is_terminal());
        assert!(!GroupStatus::Running.is_terminal());
    }

    #[test]
    fn task_result_counts_by_status() {
        let result = TaskResult {
            task_id: "t".to_string(),
            status: TaskStatus::Completed,
            outcomes: vec![
                GroupOutcome::succeeded("a", vec![]),
                GroupOutcome::failed("b", "x"),
                GroupOutcome::skipped("c"),
                GroupOutcome::skipped("d"),
            ],
            retry_of: None,
        };
        assert_eq!(result.counts(), (1, 1, 2));
        assert_eq!(result.failed_groups(), vec!["b"]);
    }
}
