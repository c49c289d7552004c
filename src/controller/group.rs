//! Per-group procedure: provision, manifest, poll, steer, tear down.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, Result};
use crate::notify::{notify_best_effort, Notifier, NotifyEvent};
use crate::protocol::{AgentPhase, Manifest, ProtocolStore, StatusFile};
use crate::sandbox::{SandboxHandle, SandboxProvider};
use crate::substrate::{GroupSnapshot, Substrate};
use crate::task::{Group, GroupOutcome, Task};

use super::ControllerConfig;

/// Phases that end the initial wait: either the pipeline finished or a
/// human decision is needed.
const INITIAL_EXIT_PHASES: &[AgentPhase] = &[
    AgentPhase::AwaitingInput,
    AgentPhase::Complete,
    AgentPhase::Failed,
    AgentPhase::Cancelled,
];

/// Runs exactly one group against exactly one sandbox.
pub(crate) struct GroupRunner<P, S> {
    pub(crate) provider: Arc<P>,
    pub(crate) substrate: Arc<S>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: ControllerConfig,
    pub(crate) task: Arc<Task>,
    pub(crate) group: Group,
}

impl<P, S> GroupRunner<P, S>
where
    P: SandboxProvider,
    S: Substrate,
{
    /// Drives the group to a terminal outcome. Never panics or errors:
    /// every failure becomes a `failed` outcome with a diagnostic, so
    /// sibling groups are unaffected.
    pub(crate) async fn run(self) -> GroupOutcome {
        let started = std::time::Instant::now();
        let name = self.group.name.clone();

        let mut outcome = match self.drive().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(group = %name, error = %e, "group failed");
                GroupOutcome::failed(&name, e.to_string())
            }
        };
        outcome.duration = Some(started.elapsed());
        outcome
    }

    async fn drive(&self) -> Result<GroupOutcome> {
        let mut handle = self
            .provider
            .provision(&self.group.name, &self.config.resources)
            .await
            .map_err(|e| match e {
                e @ Error::Provisioning { .. } => e,
                other => Error::Provisioning {
                    group: self.group.name.clone(),
                    reason: other.to_string(),
                },
            })?;

        tracing::info!(group = %self.group.name, sandbox = %handle.id(), "sandbox provisioned");

        let result = self.drive_sandbox(&mut handle).await;

        // Teardown is unconditional, error path included.
        if let Err(e) = handle.destroy().await {
            tracing::warn!(group = %self.group.name, error = %e, "sandbox teardown failed");
        }

        result
    }

    async fn drive_sandbox(&self, handle: &mut P::Handle) -> Result<GroupOutcome> {
        let store = handle.protocol().clone();
        store.write_manifest(&self.manifest())?;
        handle.start_agent().await?;

        let status = self.poll_until(&store, INITIAL_EXIT_PHASES).await?;
        if status.phase == AgentPhase::AwaitingInput {
            self.steering_loop(&store).await
        } else {
            self.outcome_from(&store, &status)
        }
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            task_id: self.task.id.clone(),
            group: self.group.clone(),
            mode: self.task.mode,
            spec: self.task.spec.clone(),
            timeout: self.task.timeout,
            require_approval: self.task.require_approval,
            max_steering_iterations: self.task.max_steering_iterations,
        }
    }

    /// Polls status until one of `until` is reached.
    ///
    /// No status inside the provisioning window is a provisioning
    /// failure; an unchanged status past the staleness window means the
    /// sandbox is unreachable. Every poll reports a substrate heartbeat
    /// so the wait is never mistaken for a stalled unit of execution.
    pub(crate) async fn poll_until(
        &self,
        store: &ProtocolStore,
        until: &[AgentPhase],
    ) -> Result<StatusFile> {
        let started = std::time::Instant::now();
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(5));
        let mut last_phase: Option<AgentPhase> = None;

        loop {
            self.substrate.heartbeat(&self.group.name).await;

            match store.read_status()? {
                None => {
                    if started.elapsed() >= self.config.resources.provisioning_window {
                        return Err(Error::Provisioning {
                            group: self.group.name.clone(),
                            reason: format!(
                                "no agent status within {:?}",
                                self.config.resources.provisioning_window
                            ),
                        });
                    }
                    self.substrate.sleep(backoff.current()).await;
                    backoff.next();
                }
                Some(status) => {
                    if last_phase != Some(status.phase) {
                        last_phase = Some(status.phase);
                        notify_best_effort(
                            self.notifier.as_ref(),
                            NotifyEvent::PhaseChanged {
                                group: self.group.name.clone(),
                                phase: status.phase,
                            },
                        )
                        .await;
                    }
                    if until.contains(&status.phase) {
                        return Ok(status);
                    }
                    self.check_staleness(&status)?;
                    self.substrate.sleep(self.config.status_poll_interval).await;
                }
            }
        }
    }

    /// Age of a status file per its own RFC 3339 stamp, so any
    /// controller instance measures against the same durable clock.
    pub(crate) fn status_age(&self, status: &StatusFile) -> Result<Duration> {
        let updated = chrono::DateTime::parse_from_rfc3339(&status.updated_at)
            .map_err(|e| Error::Protocol(format!("unparseable status timestamp: {}", e)))?;
        let age = chrono::Utc::now().signed_duration_since(updated.with_timezone(&chrono::Utc));
        Ok(age.to_std().unwrap_or(Duration::ZERO))
    }

    pub(crate) fn check_staleness(&self, status: &StatusFile) -> Result<()> {
        let age = self.status_age(status)?;
        if age >= self.config.staleness_window {
            return Err(Error::Staleness {
                group: self.group.name.clone(),
                idle_secs: age.as_secs(),
            });
        }
        Ok(())
    }

    /// Publishes the group's latest protocol state for external queries.
    pub(crate) async fn publish_snapshot(&self, store: &ProtocolStore, status: &StatusFile) {
        let result = match store.read_result() {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(group = %self.group.name, error = %e, "result unreadable for snapshot");
                None
            }
        };

        if status.phase == AgentPhase::AwaitingInput {
            if let Some(result) = &result {
                let files: Vec<_> = result.repos.iter().flat_map(|r| &r.files_changed).collect();
                notify_best_effort(
                    self.notifier.as_ref(),
                    NotifyEvent::DiffSummary {
                        group: self.group.name.clone(),
                        files_changed: files.len(),
                        additions: files.iter().map(|f| f.additions).sum(),
                        deletions: files.iter().map(|f| f.deletions).sum(),
                    },
                )
                .await;
            }
        }

        self.substrate
            .publish_snapshot(GroupSnapshot {
                group: self.group.name.clone(),
                phase: status.phase,
                result,
                updated_at: status.updated_at.clone(),
            })
            .await;
    }

    /// Maps a terminal agent status to the group outcome.
    pub(crate) fn outcome_from(
        &self,
        store: &ProtocolStore,
        status: &StatusFile,
    ) -> Result<GroupOutcome> {
        let result = store.read_result()?;
        match status.phase {
            AgentPhase::Complete => {
                let artifacts = result.map(|r| r.artifacts()).unwrap_or_default();
                Ok(GroupOutcome::succeeded(&self.group.name, artifacts))
            }
            AgentPhase::Cancelled => Ok(GroupOutcome::failed(
                &self.group.name,
                Error::HumanCancelled("rejected in review".to_string()).to_string(),
            )),
            AgentPhase::Failed => {
                let diagnostic = result
                    .as_ref()
                    .and_then(|r| r.repos.iter().find_map(|repo| repo.error.clone()))
                    .unwrap_or_else(|| status.step.clone());
                Ok(GroupOutcome::failed(&self.group.name, diagnostic))
            }
            other => Err(Error::Protocol(format!(
                "group {} stopped in non-terminal phase {:?}",
                self.group.name, other
            ))),
        }
    }
}
