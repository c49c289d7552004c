//! Derived progress views over a running task.
//!
//! `ExecutionProgress` is recomputed from group states after every
//! transition and published for external queries; it is never persisted
//! on its own.

use serde::{Deserialize, Serialize};

use crate::task::GroupStatus;

/// Snapshot of group-level progress for a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    /// Total number of groups in the task.
    pub total_groups: usize,
    /// Groups that ran to a terminal state (succeeded or failed).
    pub completed: usize,
    /// Groups that ended failed.
    pub failed: usize,
    /// Groups marked skipped without running.
    pub skipped: usize,
    /// Failure percentage over completed groups (0 when none completed).
    pub failure_percent: f64,
    /// Whether launching is paused by the failure policy.
    pub paused: bool,
    /// Human-readable pause reason, when paused.
    pub pause_reason: Option<String>,
    /// Names of groups that ended failed.
    pub failed_groups: Vec<String>,
}

impl ExecutionProgress {
    /// Derives a progress snapshot from the current group states.
    ///
    /// The failure percentage denominator is groups completed so far,
    /// not the task total, so a threshold can trip as early as possible.
    pub fn derive(states: &[(String, GroupStatus)], pause_reason: Option<&str>) -> Self {
        let total_groups = states.len();
        let completed = states.iter().filter(|(_, s)| s.is_completed()).count();
        let failed_groups: Vec<String> = states
            .iter()
            .filter(|(_, s)| *s == GroupStatus::Failed)
            .map(|(name, _)| name.clone())
            .collect();
        let failed = failed_groups.len();
        let skipped = states
            .iter()
            .filter(|(_, s)| *s == GroupStatus::Skipped)
            .count();

        let failure_percent = if completed == 0 {
            0.0
        } else {
            failed as f64 / completed as f64 * 100.0
        };

        Self {
            total_groups,
            completed,
            failed,
            skipped,
            failure_percent,
            paused: pause_reason.is_some(),
            pause_reason: pause_reason.map(str::to_string),
            failed_groups,
        }
    }

    /// True when the failure percentage strictly exceeds the threshold.
    pub fn exceeds_threshold(&self, threshold_percent: u8) -> bool {
        self.failure_percent > f64::from(threshold_percent)
    }
}

/// One human steering correction and what it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringIteration {
    /// 1-based iteration number.
    pub iteration: u32,
    /// The human's prompt text.
    pub prompt: String,
    /// RFC 3339 timestamp of when the iteration was applied.
    pub timestamp: String,
    /// Files touched by the executor in this iteration.
    pub files_touched: Vec<String>,
    /// Raw executor output for this iteration.
    pub agent_output: String,
}

/// Per-task steering bookkeeping.
///
/// Appended to only while the task is in the approval/steering loop;
/// immutable once the task reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringState {
    /// Number of steering iterations applied so far.
    pub current_iteration: u32,
    /// Cap on steering iterations.
    pub max_iterations: u32,
    /// Ordered record of every applied iteration.
    pub history: Vec<SteeringIteration>,
}

impl SteeringState {
    /// Creates an empty steering state with the given cap.
    pub fn new(max_iterations: u32) -> Self {
        Self {
            current_iteration: 0,
            max_iterations,
            history: Vec::new(),
        }
    }

    /// True when another steer instruction can still be accepted.
    pub fn can_steer(&self) -> bool {
        self.current_iteration < self.max_iterations
    }

    /// Appends an applied iteration, advancing the counter.
    pub fn record(&mut self, iteration: SteeringIteration) {
        self.current_iteration = iteration.iteration;
        self.history.push(iteration);
    }
}
