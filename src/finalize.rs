//! Finalization: pull request creation and report collection.
//!
//! Invoked by the sandbox agent exactly once per group, after a terminal
//! `approve` or when no approval is required. The agent's state machine
//! guards against repeated invocation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::git::run_git;
use crate::protocol::{CommitRecord, FileDiff};

/// Name of the structured report file an executor leaves in a clone
/// when the task runs in report mode.
pub const REPORT_FILE: &str = "armada-report.json";

/// A repository clone ready for finalization.
#[derive(Debug, Clone)]
pub struct RepoWorkspace {
    /// Repository name from the manifest.
    pub name: String,
    /// Clone directory inside the sandbox.
    pub dir: PathBuf,
    /// Branch the transformation was applied on.
    pub branch: String,
}

/// Trait for publishing a transformed repository.
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Publishes the repo's changes, returning an artifact reference
    /// (e.g. a PR URL), or `None` when there is nothing to publish.
    async fn publish(
        &self,
        repo: &RepoWorkspace,
        title: &str,
        body: &str,
    ) -> Result<Option<String>>;

    /// Returns the name of this finalizer.
    fn name(&self) -> &str;
}

/// Finalizer that commits, pushes, and opens a pull request per repo
/// using the `gh` CLI.
pub struct PullRequestFinalizer {
    base_branch: String,
}

impl Default for PullRequestFinalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PullRequestFinalizer {
    /// Creates a finalizer targeting the `main` base branch.
    pub fn new() -> Self {
        Self {
            base_branch: "main".to_string(),
        }
    }

    /// Sets the base branch PRs are opened against.
    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = base.into();
        self
    }

    /// Commits any outstanding working-tree changes.
    ///
    /// Returns the commit hash, or `None` when the tree is clean.
    pub async fn commit_changes(&self, dir: &Path, message: &str) -> Result<Option<String>> {
        run_git(dir, &["add", "-A"]).await?;

        // Clean tree: nothing staged.
        let status = run_git(dir, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(None);
        }

        run_git(dir, &["commit", "-m", message]).await?;
        let hash = run_git(dir, &["rev-parse", "HEAD"]).await?;
        Ok(Some(hash.trim().to_string()))
    }

    /// Pushes the branch to origin.
    async fn push_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        run_git(dir, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    /// Opens a PR via `gh`, returning its URL.
    async fn create_pr(
        &self,
        dir: &Path,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let output = Command::new("gh")
            .args([
                "pr",
                "create",
                "--head",
                branch,
                "--base",
                &self.base_branch,
                "--title",
                title,
                "--body",
                body,
            ])
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| Error::Finalize(format!("failed to run gh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Finalize(format!("gh pr create failed: {}", stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Finalizer for PullRequestFinalizer {
    async fn publish(
        &self,
        repo: &RepoWorkspace,
        title: &str,
        body: &str,
    ) -> Result<Option<String>> {
        let committed = self.commit_changes(&repo.dir, title).await?;

        // Nothing new committed and no commits ahead of the base means
        // there is nothing to publish for this repository.
        if committed.is_none() {
            let ahead = run_git(
                &repo.dir,
                &["rev-list", "--count", &format!("origin/{}..HEAD", self.base_branch)],
            )
            .await
            .unwrap_or_else(|_| "0".to_string());
            if ahead.trim() == "0" {
                tracing::info!(repo = %repo.name, "no changes to publish");
                return Ok(None);
            }
        }

        self.push_branch(&repo.dir, &repo.branch).await?;
        let url = self.create_pr(&repo.dir, &repo.branch, title, body).await?;

        tracing::info!(repo = %repo.name, pr_url = %url, "opened pull request");
        Ok(Some(url))
    }

    fn name(&self) -> &str {
        "pull-request"
    }
}

/// Generates a PR body from the transformation summary.
pub fn generate_pr_body(
    instruction: &str,
    files: &[FileDiff],
    commits: &[CommitRecord],
) -> String {
    let mut body = String::from("## Summary\n\n");
    body.push_str(instruction);
    body.push_str("\n\n");

    if !commits.is_empty() {
        body.push_str("## Commits\n\n");
        for commit in commits {
            let short = commit.hash.get(..7).unwrap_or(&commit.hash);
            body.push_str(&format!("- `{}` {}\n", short, commit.message));
        }
        body.push('\n');
    }

    if !files.is_empty() {
        body.push_str("## Files changed\n\n");
        for file in files {
            body.push_str(&format!(
                "- `{}` (+{} -{})\n",
                file.path, file.additions, file.deletions
            ));
        }
        body.push('\n');
    }

    body.push_str("---\nGenerated by armada.\n");
    body
}

/// Reads and validates the structured report an executor left in a clone.
pub fn collect_report(dir: &Path) -> Result<serde_json::Value> {
    let path = dir.join(REPORT_FILE);
    let bytes = std::fs::read(&path).map_err(|e| {
        Error::Finalize(format!("report file {} unreadable: {}", path.display(), e))
    })?;

    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Finalize(format!("report is not valid JSON: {}", e)))?;

    if !value.is_object() {
        return Err(Error::Finalize(
            "report must be a JSON object at the top level".to_string(),
        ));
    }

    Ok(value)
}
