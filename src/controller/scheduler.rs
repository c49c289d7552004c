//! Grouped bounded-parallel execution with failure thresholds.
//!
//! Completions are reaped one at a time from a `JoinSet`, so the failure
//! threshold is never evaluated concurrently: two simultaneous failures
//! cannot both miss a threshold their combination exceeds.

use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::notify::{notify_best_effort, NotifyEvent};
use crate::progress::ExecutionProgress;
use crate::sandbox::SandboxProvider;
use crate::substrate::{PauseDecision, Substrate};
use crate::task::{FailureAction, GroupOutcome, GroupStatus, Task, TaskResult, TaskStatus};

use super::group::GroupRunner;
use super::TaskController;

impl<P, S> TaskController<P, S>
where
    P: SandboxProvider + 'static,
    P::Handle: 'static,
    S: Substrate + 'static,
{
    /// Drives the task to its terminal result.
    ///
    /// Partial success (some groups failed or skipped) is a normal
    /// `completed` result; only a human cancellation makes the task
    /// `cancelled`.
    pub async fn run(&self, task: Task) -> Result<TaskResult> {
        if task.groups.is_empty() {
            return Err(Error::Config("task has no groups".to_string()));
        }
        if let Some(policy) = &task.failure_policy {
            if policy.threshold_percent > 100 {
                return Err(Error::Config(format!(
                    "failure threshold {}% is not a percentage",
                    policy.threshold_percent
                )));
            }
        }

        let task = std::sync::Arc::new(task);
        let total = task.groups.len();
        let mut states: Vec<(String, GroupStatus)> = task
            .groups
            .iter()
            .map(|g| (g.name.clone(), GroupStatus::Pending))
            .collect();
        let mut outcomes: Vec<GroupOutcome> = Vec::with_capacity(total);
        let mut join_set: JoinSet<(usize, GroupOutcome)> = JoinSet::new();

        let mut next = 0usize;
        let mut paused = false;
        // Launching stopped for good: threshold abort, skip-remaining,
        // or task cancellation.
        let mut halted = false;
        let mut cancelled = false;
        let mut pause_reason: Option<String> = None;

        tracing::info!(
            task_id = %task.id,
            groups = total,
            max_parallel = task.max_parallel,
            mode = ?task.mode,
            "task started"
        );

        loop {
            while !paused && !halted && next < total && join_set.len() < task.max_parallel {
                let idx = next;
                next += 1;
                states[idx].1 = GroupStatus::Running;

                let group = task.groups[idx].clone();
                tracing::info!(task_id = %task.id, group = %group.name, "launching group");
                notify_best_effort(
                    self.notifier.as_ref(),
                    NotifyEvent::GroupLaunched {
                        task_id: task.id.clone(),
                        group: group.name.clone(),
                    },
                )
                .await;

                let runner = GroupRunner {
                    provider: self.provider.clone(),
                    substrate: self.substrate.clone(),
                    notifier: self.notifier.clone(),
                    config: self.config.clone(),
                    task: task.clone(),
                    group,
                };
                join_set.spawn(async move { (idx, runner.run().await) });
            }

            self.substrate
                .publish_progress(
                    &task.id,
                    ExecutionProgress::derive(&states, pause_reason.as_deref()),
                )
                .await;

            if join_set.is_empty() {
                if paused && next < total {
                    // Everything in flight has drained; nothing more
                    // happens until a human decides.
                    let decision = self.substrate.wait_for_pause_decision().await;
                    apply_pause_decision(
                        decision,
                        &mut states,
                        &mut outcomes,
                        &mut next,
                        &mut paused,
                        &mut halted,
                        &mut cancelled,
                        &mut pause_reason,
                    );
                    continue;
                }
                break;
            }

            let joined = if paused {
                tokio::select! {
                    joined = join_set.join_next() => joined,
                    decision = self.substrate.wait_for_pause_decision() => {
                        apply_pause_decision(
                            decision,
                            &mut states,
                            &mut outcomes,
                            &mut next,
                            &mut paused,
                            &mut halted,
                            &mut cancelled,
                            &mut pause_reason,
                        );
                        continue;
                    }
                }
            } else {
                join_set.join_next().await
            };

            let Some(joined) = joined else { continue };
            let (idx, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "group execution unit aborted");
                    continue;
                }
            };

            states[idx].1 = outcome.status;
            notify_best_effort(
                self.notifier.as_ref(),
                NotifyEvent::GroupCompleted {
                    group: outcome.group.clone(),
                    status: outcome.status,
                    diagnostic: outcome.diagnostic.clone(),
                },
            )
            .await;
            outcomes.push(outcome);

            let progress = ExecutionProgress::derive(&states, pause_reason.as_deref());
            self.substrate
                .publish_progress(&task.id, progress.clone())
                .await;

            if let Some(policy) = &task.failure_policy {
                if !paused && !halted && progress.exceeds_threshold(policy.threshold_percent) {
                    match policy.action {
                        FailureAction::Pause => {
                            paused = true;
                            pause_reason = Some(format!(
                                "failure threshold exceeded: {:.1}% > {}% (failed: {})",
                                progress.failure_percent,
                                policy.threshold_percent,
                                progress.failed_groups.join(", ")
                            ));
                            tracing::warn!(
                                task_id = %task.id,
                                failure_percent = progress.failure_percent,
                                "pausing launches on failure threshold"
                            );
                            notify_best_effort(
                                self.notifier.as_ref(),
                                NotifyEvent::ExecutionPaused {
                                    task_id: task.id.clone(),
                                    failure_percent: progress.failure_percent,
                                    failed_groups: progress.failed_groups.clone(),
                                },
                            )
                            .await;
                            self.substrate
                                .publish_progress(
                                    &task.id,
                                    ExecutionProgress::derive(&states, pause_reason.as_deref()),
                                )
                                .await;
                        }
                        FailureAction::Abort => {
                            tracing::warn!(
                                task_id = %task.id,
                                failure_percent = progress.failure_percent,
                                "aborting remaining groups on failure threshold"
                            );
                            halted = true;
                            skip_pending(&mut states, &mut outcomes, &mut next);
                        }
                    }
                }
            }
        }

        // A join error leaves its group without an outcome; surface it
        // rather than reporting a short result.
        for (name, state) in states.iter_mut() {
            if *state == GroupStatus::Running {
                *state = GroupStatus::Failed;
                outcomes.push(GroupOutcome::failed(
                    name.clone(),
                    "group execution unit aborted unexpectedly",
                ));
            }
        }

        self.substrate
            .publish_progress(
                &task.id,
                ExecutionProgress::derive(&states, pause_reason.as_deref()),
            )
            .await;

        let result = TaskResult {
            task_id: task.id.clone(),
            status: if cancelled {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Completed
            },
            outcomes,
            retry_of: task.retry_of.clone(),
        };

        let (succeeded, failed, skipped) = result.counts();
        tracing::info!(
            task_id = %task.id,
            succeeded,
            failed,
            skipped,
            status = ?result.status,
            "task finished"
        );
        notify_best_effort(
            self.notifier.as_ref(),
            NotifyEvent::TaskFinished {
                task_id: task.id.clone(),
                succeeded,
                failed,
                skipped,
            },
        )
        .await;

        Ok(result)
    }
}

/// Marks every not-yet-started group skipped and stops further launches.
fn skip_pending(
    states: &mut [(String, GroupStatus)],
    outcomes: &mut Vec<GroupOutcome>,
    next: &mut usize,
) {
    for (name, state) in states.iter_mut() {
        if *state == GroupStatus::Pending {
            *state = GroupStatus::Skipped;
            outcomes.push(GroupOutcome::skipped(name.clone()));
        }
    }
    *next = states.len();
}

#[allow(clippy::too_many_arguments)]
fn apply_pause_decision(
    decision: PauseDecision,
    states: &mut [(String, GroupStatus)],
    outcomes: &mut Vec<GroupOutcome>,
    next: &mut usize,
    paused: &mut bool,
    halted: &mut bool,
    cancelled: &mut bool,
    pause_reason: &mut Option<String>,
) {
    match decision {
        PauseDecision::Continue => {
            tracing::info!("human decision: resume launching");
            *paused = false;
            *pause_reason = None;
        }
        PauseDecision::SkipRemaining => {
            tracing::info!("human decision: skip remaining groups");
            *paused = false;
            *halted = true;
            *pause_reason = None;
            skip_pending(states, outcomes, next);
        }
        PauseDecision::Cancel => {
            tracing::warn!("human decision: cancel task");
            *paused = false;
            *halted = true;
            *cancelled = true;
            *pause_reason = None;
            skip_pending(states, outcomes, next);
        }
    }
}
