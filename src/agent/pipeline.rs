//! Pipeline passes executed inside the sandbox.
//!
//! A pass is one executor invocation (plus verification and diff
//! collection) across every repository in the group. The first pass also
//! clones; steering passes reuse the existing checkouts.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::executor::{ContextTurn, ExecutorRequest, TransformExecutor};
use crate::git;
use crate::protocol::{
    AgentPhase, Manifest, ProtocolStore, RepoResult, StatusFile, VerifierOutcome,
};
use crate::task::{ExecutionSpec, RepoSpec};
use crate::verifier::VerifierRunner;

/// A cloned repository ready for transformation.
#[derive(Debug, Clone)]
pub(crate) struct RepoCheckout {
    pub spec: RepoSpec,
    pub dir: PathBuf,
    /// HEAD at clone time; diffs and commit lists are taken against it.
    pub base_commit: String,
    /// Branch the transformation is applied on.
    pub branch: String,
}

/// Everything one pass produced.
#[derive(Debug, Clone)]
pub(crate) struct PassOutcome {
    pub repos: Vec<RepoResult>,
    pub raw_output: String,
    pub files_touched: Vec<String>,
    /// Unrecoverable diagnostic; verifier failures are captured in the
    /// per-repo outcomes instead.
    pub error: Option<String>,
}

/// Clones every repository in the group, checks out the work branch,
/// and runs any setup commands.
pub(crate) async fn clone_repos(
    store: &ProtocolStore,
    manifest: &Manifest,
    workspace: &Path,
) -> Result<Vec<RepoCheckout>> {
    let total = manifest.group.repos.len();
    let short_id = manifest.task_id.get(..8).unwrap_or(&manifest.task_id);
    let branch = format!("armada/{}", short_id);

    let mut checkouts = Vec::with_capacity(total);
    for (done, repo) in manifest.group.repos.iter().enumerate() {
        store.write_status(
            &StatusFile::now(AgentPhase::Cloning, format!("cloning {}", repo.name))
                .with_repo_progress(done, total),
        )?;

        let dir = workspace.join(&repo.name);
        git::clone_repo(&repo.url, &dir)
            .await
            .map_err(|e| Error::Pipeline(format!("clone of {} failed: {}", repo.name, e)))?;
        git::checkout_branch(&dir, &branch).await?;
        let base_commit = git::head_commit(&dir).await?;

        for command in &repo.setup_commands {
            run_setup(&dir, &repo.name, command).await?;
        }

        checkouts.push(RepoCheckout {
            spec: repo.clone(),
            dir,
            base_commit,
            branch: branch.clone(),
        });
    }

    Ok(checkouts)
}

async fn run_setup(dir: &Path, repo: &str, command: &str) -> Result<()> {
    tracing::debug!(repo = %repo, command = %command, "running setup command");

    let output = Command::new("sh")
        .args(["-c", command])
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Pipeline(format!("setup `{}` in {} failed to spawn: {}", command, repo, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Pipeline(format!(
            "setup `{}` in {} exited {:?}: {}",
            command,
            repo,
            output.status.code(),
            stderr.trim()
        )));
    }

    Ok(())
}

/// Runs one executor pass over every checkout, then verifies and
/// collects diffs.
pub(crate) async fn execute_pass(
    store: &ProtocolStore,
    manifest: &Manifest,
    checkouts: &[RepoCheckout],
    executor: &dyn TransformExecutor,
    instruction: &str,
    context: &[ContextTurn],
    iteration: u32,
) -> Result<PassOutcome> {
    let verifier = VerifierRunner::new();
    let total = checkouts.len();

    let mut repos = Vec::with_capacity(total);
    let mut raw_output = String::new();
    let mut files_touched = Vec::new();
    let mut error: Option<String> = None;

    for (done, checkout) in checkouts.iter().enumerate() {
        let name = &checkout.spec.name;
        store.write_status(
            &StatusFile::now(AgentPhase::Executing, format!("transforming {}", name))
                .with_repo_progress(done, total)
                .with_steering_iteration(iteration),
        )?;

        let mut repo = RepoResult::new(name);
        let request = ExecutorRequest {
            instruction: instruction.to_string(),
            context: context.to_vec(),
            working_dir: checkout.dir.clone(),
        };

        match executor.execute(request).await {
            Err(e) => {
                let diagnostic = format!("executor failed in {}: {}", name, e);
                repo.error = Some(diagnostic.clone());
                error.get_or_insert(diagnostic);
                repos.push(repo);
                continue;
            }
            Ok(outcome) => {
                raw_output.push_str(&format!("=== {} ===\n{}", name, outcome.raw_output));

                if !outcome.success {
                    let diagnostic = format!(
                        "executor exited {:?} in {}",
                        outcome.exit_code, name
                    );
                    repo.error = Some(diagnostic.clone());
                    error.get_or_insert(diagnostic);
                }

                store.write_status(
                    &StatusFile::now(AgentPhase::Verifying, format!("verifying {}", name))
                        .with_repo_progress(done, total)
                        .with_steering_iteration(iteration),
                )?;

                repo.verifier_outcomes = match &manifest.spec {
                    ExecutionSpec::Agentic { verifiers, .. } => {
                        verifier.run_all(verifiers, &checkout.dir).await
                    }
                    // A deterministic run is verified by its own exit status.
                    ExecutionSpec::Deterministic { command } => vec![VerifierOutcome {
                        command: command.clone(),
                        exit_code: outcome.exit_code,
                        output: outcome.raw_output.clone(),
                    }],
                };

                repo.diff = git::working_diff(&checkout.dir, &checkout.base_commit)
                    .await
                    .unwrap_or_default();
                repo.files_changed = git::file_changes(&checkout.dir, &checkout.base_commit)
                    .await
                    .unwrap_or_default();
                repo.commits = git::commits_since(&checkout.dir, &checkout.base_commit)
                    .await
                    .unwrap_or_default();

                files_touched.extend(outcome.files_changed);
                files_touched.extend(repo.files_changed.iter().map(|f| f.path.clone()));
                repos.push(repo);
            }
        }
    }

    files_touched.sort();
    files_touched.dedup();

    Ok(PassOutcome {
        repos,
        raw_output,
        files_touched,
        error,
    })
}
