//! Notification channel for phase transitions and diff summaries.
//!
//! Notification failures are logged and swallowed; they never block the
//! pipeline.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::AgentPhase;
use crate::task::GroupStatus;

/// An event worth telling a human about.
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    /// A group was bound to a sandbox and launched.
    GroupLaunched { task_id: String, group: String },
    /// The controller observed an agent phase transition.
    PhaseChanged { group: String, phase: AgentPhase },
    /// A group reached a terminal outcome.
    GroupCompleted {
        group: String,
        status: GroupStatus,
        diagnostic: Option<String>,
    },
    /// Summary of the changes a group is waiting on approval for.
    DiffSummary {
        group: String,
        files_changed: usize,
        additions: u32,
        deletions: u32,
    },
    /// Launching stopped because the failure threshold was exceeded.
    ExecutionPaused {
        task_id: String,
        failure_percent: f64,
        failed_groups: Vec<String>,
    },
    /// A steering prompt was relayed to a group's agent.
    SteeringApplied {
        group: String,
        iteration: u32,
        prompt: String,
    },
    /// A steering instruction was rejected at the iteration cap.
    SteeringRejected { group: String, reason: String },
    /// The task reached its terminal result.
    TaskFinished {
        task_id: String,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Trait for notification channels.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one event.
    async fn notify(&self, event: NotifyEvent) -> Result<()>;
}

/// Sends an event, logging and swallowing any delivery failure.
pub async fn notify_best_effort(notifier: &dyn Notifier, event: NotifyEvent) {
    if let Err(e) = notifier.notify(event).await {
        tracing::warn!(error = %e, "failed to deliver notification, continuing");
    }
}

/// Notifier that emits structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl LogNotifier {
    /// Creates a log notifier.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifyEvent) -> Result<()> {
        match event {
            NotifyEvent::GroupLaunched { task_id, group } => {
                tracing::info!(task_id = %task_id, group = %group, "group launched");
            }
            NotifyEvent::PhaseChanged { group, phase } => {
                tracing::info!(group = %group, phase = ?phase, "agent phase changed");
            }
            NotifyEvent::GroupCompleted {
                group,
                status,
                diagnostic,
            } => {
                tracing::info!(
                    group = %group,
                    status = ?status,
                    diagnostic = diagnostic.as_deref().unwrap_or("-"),
                    "group completed"
                );
            }
            NotifyEvent::DiffSummary {
                group,
                files_changed,
                additions,
                deletions,
            } => {
                tracing::info!(
                    group = %group,
                    files_changed,
                    additions,
                    deletions,
                    "awaiting review"
                );
            }
            NotifyEvent::ExecutionPaused {
                task_id,
                failure_percent,
                failed_groups,
            } => {
                tracing::warn!(
                    task_id = %task_id,
                    failure_percent,
                    failed_groups = ?failed_groups,
                    "execution paused on failure threshold"
                );
            }
            NotifyEvent::SteeringApplied {
                group,
                iteration,
                prompt,
            } => {
                tracing::info!(group = %group, iteration, prompt = %prompt, "steering applied");
            }
            NotifyEvent::SteeringRejected { group, reason } => {
                tracing::warn!(group = %group, reason = %reason, "steering rejected");
            }
            NotifyEvent::TaskFinished {
                task_id,
                succeeded,
                failed,
                skipped,
            } => {
                tracing::info!(task_id = %task_id, succeeded, failed, skipped, "task finished");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _event: NotifyEvent) -> Result<()> {
            Err(Error::Config("channel unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        // Must not panic or propagate.
        notify_best_effort(
            &FailingNotifier,
            NotifyEvent::GroupLaunched {
                task_id: "t".to_string(),
                group: "g".to_string(),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn log_notifier_accepts_every_event() {
        let notifier = LogNotifier::new();
        notifier
            .notify(NotifyEvent::TaskFinished {
                task_id: "t".to_string(),
                succeeded: 3,
                failed: 1,
                skipped: 0,
            })
            .await
            .unwrap();
    }
}
