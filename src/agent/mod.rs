//! Sandbox agent: runs one group's pipeline autonomously.
//!
//! The agent is independent of whichever controller instance (if any) is
//! currently watching it: everything it knows arrives through the
//! manifest, and everything it reports leaves through status and result
//! files. Pipeline errors become a `failed` status with diagnostics,
//! never a process crash.

mod pipeline;

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::error::{Error, Result};
use crate::executor::{executor_for_spec, ContextTurn, TransformExecutor};
use crate::finalize::{collect_report, generate_pr_body, Finalizer, PullRequestFinalizer, RepoWorkspace};
use crate::progress::{SteeringIteration, SteeringState};
use crate::protocol::{
    AgentPhase, Manifest, ProtocolStore, ResultFile, StatusFile, SteeringAction,
};
use crate::task::{ExecutionSpec, TaskMode};

use pipeline::{clone_repos, execute_pass, PassOutcome, RepoCheckout};

/// Protocol file-exchange directory inside a sandbox.
pub const PROTOCOL_SUBDIR: &str = "proto";
/// Repository clone directory inside a sandbox.
pub const WORKSPACE_SUBDIR: &str = "work";

/// Agent timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// How often to poll for a steering instruction while awaiting input.
    pub instruction_poll_interval: Duration,
    /// How long to wait for the controller to write a manifest.
    pub manifest_wait: Duration,
    /// How often to re-stamp the status file during active phases, so a
    /// long executor run is not mistaken for a dead sandbox.
    pub status_refresh_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instruction_poll_interval: Duration::from_secs(2),
            manifest_wait: Duration::from_secs(60),
            status_refresh_interval: Duration::from_secs(10),
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keeps the status stamp fresh while the agent is in an active phase,
/// so a long executor run is not mistaken for a dead sandbox. The store
/// skips `awaiting_input` and terminal statuses itself.
fn spawn_status_refresher(store: ProtocolStore, interval: Duration) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = store.refresh_active_status() {
                tracing::warn!(error = %e, "status refresh failed");
            }
        }
    }))
}

/// The agent process driving one group inside its sandbox.
pub struct SandboxAgent {
    store: ProtocolStore,
    workspace: PathBuf,
    config: AgentConfig,
    executor: Option<Box<dyn TransformExecutor>>,
    finalizer: Box<dyn Finalizer>,
    finalized: bool,
}

impl SandboxAgent {
    /// Creates an agent rooted at a sandbox directory, which holds the
    /// protocol exchange under `proto/` and repository clones under
    /// `work/`.
    pub fn new(sandbox_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = sandbox_dir.into();
        let store = ProtocolStore::open(dir.join(PROTOCOL_SUBDIR))?;
        let workspace = dir.join(WORKSPACE_SUBDIR);
        std::fs::create_dir_all(&workspace)?;

        Ok(Self {
            store,
            workspace,
            config: AgentConfig::default(),
            executor: None,
            finalizer: Box::new(PullRequestFinalizer::new()),
            finalized: false,
        })
    }

    /// Overrides the timing configuration.
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the executor. The default is chosen from the
    /// manifest's execution spec.
    pub fn with_executor(mut self, executor: Box<dyn TransformExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Overrides the finalizer. The default opens pull requests via `gh`.
    pub fn with_finalizer(mut self, finalizer: Box<dyn Finalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Runs the full agent state machine to a terminal status.
    ///
    /// Returns `Err` only for unrecoverable protocol-store failures;
    /// pipeline problems end as a `failed` status instead.
    pub async fn run(&mut self) -> Result<()> {
        self.store
            .write_status(&StatusFile::now(AgentPhase::Idle, "waiting for manifest"))?;
        let manifest = self.wait_for_manifest().await?;
        let _refresher =
            spawn_status_refresher(self.store.clone(), self.config.status_refresh_interval);

        tracing::info!(
            task_id = %manifest.task_id,
            group = %manifest.group.name,
            repos = manifest.group.repos.len(),
            "manifest received, starting pipeline"
        );

        let executor = match self.executor.take() {
            Some(executor) => executor,
            None => executor_for_spec(&manifest.spec),
        };
        let mut steering = SteeringState::new(manifest.max_steering_iterations);
        let mut context: Vec<ContextTurn> = Vec::new();
        let base_instruction = match &manifest.spec {
            ExecutionSpec::Agentic { instruction, .. } => instruction.clone(),
            ExecutionSpec::Deterministic { command } => command.clone(),
        };

        self.store.write_status(&StatusFile::now(
            AgentPhase::Initializing,
            "preparing workspace",
        ))?;

        // The wall clock covers clone through verification; the agent
        // enforces it itself so a controller outage cannot leave it
        // running unbounded.
        let deadline = Instant::now() + manifest.timeout;
        let checkouts = match timeout_at(deadline, clone_repos(&self.store, &manifest, &self.workspace)).await
        {
            Err(_) => return self.fail_timeout(&manifest, &steering),
            Ok(Err(e)) => return self.fail(e.to_string(), &steering),
            Ok(Ok(checkouts)) => checkouts,
        };

        let pass = match timeout_at(
            deadline,
            execute_pass(
                &self.store,
                &manifest,
                &checkouts,
                executor.as_ref(),
                &base_instruction,
                &context,
                0,
            ),
        )
        .await
        {
            Err(_) => return self.fail_timeout(&manifest, &steering),
            Ok(Err(e)) => return self.fail(e.to_string(), &steering),
            Ok(Ok(pass)) => pass,
        };

        context.push(ContextTurn {
            prompt: base_instruction.clone(),
            output: pass.raw_output.clone(),
        });

        let mut result = ResultFile {
            task_id: manifest.task_id.clone(),
            group: manifest.group.name.clone(),
            repos: pass.repos.clone(),
            raw_output: pass.raw_output.clone(),
            steering: steering.clone(),
        };
        self.store.write_result(&result)?;

        if let Some(diagnostic) = pass.error {
            return self.fail(diagnostic, &steering);
        }

        if !manifest.require_approval {
            // With no human gate, a failing verifier fails the group;
            // under approval it surfaces for review instead.
            let dirty: Vec<&str> = result
                .repos
                .iter()
                .filter(|r| !r.is_clean())
                .map(|r| r.repo.as_str())
                .collect();
            if !dirty.is_empty() {
                return self.fail(format!("verifier failed in {}", dirty.join(", ")), &steering);
            }
            return self
                .finalize(&manifest, &checkouts, &mut result, &steering, &base_instruction)
                .await;
        }

        self.await_input(
            &manifest,
            executor.as_ref(),
            &checkouts,
            &mut steering,
            &mut context,
            &mut result,
            &base_instruction,
        )
        .await
    }

    async fn wait_for_manifest(&self) -> Result<Manifest> {
        let started = std::time::Instant::now();
        loop {
            if let Some(manifest) = self.store.read_manifest()? {
                return Ok(manifest);
            }
            if started.elapsed() >= self.config.manifest_wait {
                return Err(Error::Config(
                    "no manifest arrived in the sandbox".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// The approval loop: poll for instructions, acting only on the most
    /// recently written one, until a terminal decision arrives.
    #[allow(clippy::too_many_arguments)]
    async fn await_input(
        &mut self,
        manifest: &Manifest,
        executor: &dyn TransformExecutor,
        checkouts: &[RepoCheckout],
        steering: &mut SteeringState,
        context: &mut Vec<ContextTurn>,
        result: &mut ResultFile,
        base_instruction: &str,
    ) -> Result<()> {
        let mut last_seq = 0u64;
        self.store
            .write_status(&self.awaiting_status(checkouts.len(), steering, None))?;

        loop {
            tokio::time::sleep(self.config.instruction_poll_interval).await;

            let Some(instruction) = self.store.consume_instruction()? else {
                continue;
            };
            if instruction.seq <= last_seq {
                tracing::debug!(seq = instruction.seq, "discarding superseded instruction");
                continue;
            }
            last_seq = instruction.seq;

            match instruction.action {
                SteeringAction::Approve => {
                    return self
                        .finalize(manifest, checkouts, result, steering, base_instruction)
                        .await;
                }
                SteeringAction::Reject | SteeringAction::Cancel => {
                    tracing::info!(group = %manifest.group.name, "work discarded by human decision");
                    self.store.write_status(
                        &StatusFile::now(AgentPhase::Cancelled, "rejected by human decision")
                            .with_repo_progress(checkouts.len(), checkouts.len())
                            .with_steering_iteration(steering.current_iteration),
                    )?;
                    return Ok(());
                }
                SteeringAction::Steer { prompt } => {
                    if !steering.can_steer() {
                        let reason = Error::IterationLimitReached {
                            current: steering.current_iteration,
                            max: steering.max_iterations,
                        }
                        .to_string();
                        tracing::warn!(group = %manifest.group.name, %reason, "steer rejected");
                        self.store.write_status(&self.awaiting_status(
                            checkouts.len(),
                            steering,
                            Some(reason),
                        ))?;
                        continue;
                    }

                    let iteration = steering.current_iteration + 1;
                    tracing::info!(
                        group = %manifest.group.name,
                        iteration,
                        prompt = %prompt,
                        "applying steering correction"
                    );

                    let deadline = Instant::now() + manifest.timeout;
                    let pass: PassOutcome = match timeout_at(
                        deadline,
                        execute_pass(
                            &self.store,
                            manifest,
                            checkouts,
                            executor,
                            &prompt,
                            context,
                            iteration,
                        ),
                    )
                    .await
                    {
                        Err(_) => return self.fail_timeout(manifest, steering),
                        Ok(Err(e)) => return self.fail(e.to_string(), steering),
                        Ok(Ok(pass)) => pass,
                    };

                    context.push(ContextTurn {
                        prompt: prompt.clone(),
                        output: pass.raw_output.clone(),
                    });
                    steering.record(SteeringIteration {
                        iteration,
                        prompt,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        files_touched: pass.files_touched.clone(),
                        agent_output: pass.raw_output.clone(),
                    });

                    result.repos = pass.repos;
                    result.raw_output = pass.raw_output;
                    result.steering = steering.clone();
                    self.store.write_result(result)?;

                    if let Some(diagnostic) = pass.error {
                        return self.fail(diagnostic, steering);
                    }

                    self.store
                        .write_status(&self.awaiting_status(checkouts.len(), steering, None))?;
                }
            }
        }
    }

    /// Publishes the group's outcome. Runs at most once per task.
    async fn finalize(
        &mut self,
        manifest: &Manifest,
        checkouts: &[RepoCheckout],
        result: &mut ResultFile,
        steering: &SteeringState,
        base_instruction: &str,
    ) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalize(
                "finalization attempted more than once".to_string(),
            ));
        }
        self.finalized = true;

        self.store.write_status(
            &StatusFile::now(AgentPhase::Finalizing, "publishing results")
                .with_repo_progress(checkouts.len(), checkouts.len())
                .with_steering_iteration(steering.current_iteration),
        )?;

        for checkout in checkouts {
            let Some(repo) = result
                .repos
                .iter_mut()
                .find(|r| r.repo == checkout.spec.name)
            else {
                continue;
            };

            match manifest.mode {
                TaskMode::Transform => {
                    let title = pr_title(base_instruction);
                    let body = generate_pr_body(base_instruction, &repo.files_changed, &repo.commits);
                    let workspace = RepoWorkspace {
                        name: checkout.spec.name.clone(),
                        dir: checkout.dir.clone(),
                        branch: checkout.branch.clone(),
                    };
                    match self.finalizer.publish(&workspace, &title, &body).await {
                        Ok(artifact) => repo.artifact = artifact,
                        Err(e) => {
                            let diagnostic =
                                format!("finalization failed for {}: {}", checkout.spec.name, e);
                            self.store.write_result(result)?;
                            return self.fail(diagnostic, steering);
                        }
                    }
                }
                TaskMode::Report => match collect_report(&checkout.dir) {
                    Ok(report) => repo.report = Some(report),
                    Err(e) => {
                        let diagnostic =
                            format!("report collection failed for {}: {}", checkout.spec.name, e);
                        self.store.write_result(result)?;
                        return self.fail(diagnostic, steering);
                    }
                },
            }
        }

        result.steering = steering.clone();
        self.store.write_result(result)?;
        self.store.write_status(
            &StatusFile::now(AgentPhase::Complete, "finalization complete")
                .with_repo_progress(checkouts.len(), checkouts.len())
                .with_steering_iteration(steering.current_iteration),
        )?;

        tracing::info!(group = %manifest.group.name, "group complete");
        Ok(())
    }

    fn awaiting_status(
        &self,
        repos: usize,
        steering: &SteeringState,
        rejected: Option<String>,
    ) -> StatusFile {
        let mut status = StatusFile::now(AgentPhase::AwaitingInput, "waiting for human decision")
            .with_repo_progress(repos, repos)
            .with_steering_iteration(steering.current_iteration);
        if let Some(reason) = rejected {
            status = status.with_rejected_instruction(reason);
        }
        status
    }

    fn fail(&self, diagnostic: String, steering: &SteeringState) -> Result<()> {
        tracing::error!(error = %diagnostic, "pipeline failed");
        self.store.write_status(
            &StatusFile::now(AgentPhase::Failed, diagnostic)
                .with_steering_iteration(steering.current_iteration),
        )?;
        Ok(())
    }

    fn fail_timeout(&self, manifest: &Manifest, steering: &SteeringState) -> Result<()> {
        let diagnostic = Error::Timeout(manifest.timeout.as_secs()).to_string();
        self.fail(diagnostic, steering)
    }
}

/// First line of the instruction, bounded for use as a PR title.
fn pr_title(instruction: &str) -> String {
    let first = instruction.lines().next().unwrap_or("Fleet transformation");
    if first.chars().count() > 72 {
        let truncated: String = first.chars().take(69).collect();
        format!("{}...", truncated)
    } else {
        first.to_string()
    }
}
