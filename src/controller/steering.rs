//! The approval/steering loop, entered once per group that reaches
//! `awaiting_input`.
//!
//! One event loop serves both sources: each iteration polls the agent's
//! status file and then waits one poll interval for a human decision, so
//! a decision arriving at any point (including while a steer round is in
//! flight) is written promptly and supersedes the pending instruction by
//! sequence number. Human inactivity is measured against the status
//! file's own timestamp, which any resumed controller instance observes
//! identically.

use std::time::Instant;

use crate::error::{Error, Result};
use crate::notify::{notify_best_effort, NotifyEvent};
use crate::protocol::{AgentPhase, ProtocolStore, SteeringAction, SteeringInstruction};
use crate::sandbox::SandboxProvider;
use crate::substrate::{HumanDecision, Substrate};
use crate::task::GroupOutcome;

use super::group::GroupRunner;

impl<P, S> GroupRunner<P, S>
where
    P: SandboxProvider,
    S: Substrate,
{
    pub(crate) async fn steering_loop(&self, store: &ProtocolStore) -> Result<GroupOutcome> {
        let group = self.group.name.clone();
        let mut seq: u64 = 0;
        let mut last_seen_update: Option<String> = None;
        // Set while a written instruction awaits consumption; an agent
        // that never acknowledges is unreachable.
        let mut pending_since: Option<Instant> = None;

        loop {
            self.substrate.heartbeat(&group).await;

            let Some(status) = store.read_status()? else {
                return Err(Error::Protocol(format!(
                    "status file disappeared for group {}",
                    group
                )));
            };

            let acknowledged = store.instruction_acknowledged();
            if acknowledged {
                pending_since = None;
            }

            if last_seen_update.as_deref() != Some(status.updated_at.as_str()) {
                last_seen_update = Some(status.updated_at.clone());
                self.publish_snapshot(store, &status).await;
                if let Some(reason) = &status.rejected_instruction {
                    notify_best_effort(
                        self.notifier.as_ref(),
                        NotifyEvent::SteeringRejected {
                            group: group.clone(),
                            reason: reason.clone(),
                        },
                    )
                    .await;
                }
            }

            if status.phase.is_terminal() {
                return self.outcome_from(store, &status);
            }

            if let Some(written) = pending_since {
                // Instruction on disk but unconsumed: the agent polls
                // every couple of seconds, so a long silence means it
                // died while awaiting input.
                if written.elapsed() >= self.config.staleness_window {
                    return Err(Error::Staleness {
                        group: group.clone(),
                        idle_secs: written.elapsed().as_secs(),
                    });
                }
            } else if status.phase == AgentPhase::AwaitingInput {
                if self.status_age(&status)? >= self.config.decision_timeout {
                    tracing::warn!(group = %group, "inactivity window expired, cancelling");
                    seq += 1;
                    store.write_instruction(&SteeringInstruction::new(seq, SteeringAction::Cancel))?;
                    pending_since = Some(Instant::now());
                    continue;
                }
            } else {
                // Steer round in flight; the agent refreshes its status
                // while working, so an unchanged stamp means it is gone.
                self.check_staleness(&status)?;
            }

            // Doubles as the poll sleep: either a decision arrives within
            // one interval, or the next status poll happens on time.
            let Some(decision) = self
                .substrate
                .wait_for_decision(&group, self.config.status_poll_interval)
                .await
            else {
                continue;
            };

            seq += 1;
            if let HumanDecision::Steer { prompt } = &decision {
                notify_best_effort(
                    self.notifier.as_ref(),
                    NotifyEvent::SteeringApplied {
                        group: group.clone(),
                        iteration: status.steering_iteration + 1,
                        prompt: prompt.clone(),
                    },
                )
                .await;
            }
            tracing::info!(group = %group, seq, decision = ?decision, "relaying human decision");

            let action = match decision {
                HumanDecision::Steer { prompt } => SteeringAction::Steer { prompt },
                HumanDecision::Approve => SteeringAction::Approve,
                HumanDecision::Reject => SteeringAction::Reject,
                HumanDecision::Cancel => SteeringAction::Cancel,
            };
            store.write_instruction(&SteeringInstruction::new(seq, action))?;
            pending_since = Some(Instant::now());
        }
    }
}
