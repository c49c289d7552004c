//! Git operations for sandbox repository clones.

use std::path::Path;

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::protocol::{CommitRecord, FileDiff};

/// Runs a git subcommand in `dir`, returning stdout.
pub async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git {:?}: {}", args, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!("git {:?} failed: {}", args, stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Clones `url` into `dest` with a shallow history.
pub async fn clone_repo(url: &str, dest: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["clone", "--depth", "1", url])
        .arg(dest)
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git clone: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!("git clone {} failed: {}", url, stderr)));
    }

    Ok(())
}

/// Creates and checks out a new branch.
pub async fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    run_git(dir, &["checkout", "-b", branch]).await?;
    Ok(())
}

/// Returns the current HEAD commit hash.
pub async fn head_commit(dir: &Path) -> Result<String> {
    let out = run_git(dir, &["rev-parse", "HEAD"]).await?;
    Ok(out.trim().to_string())
}

/// Returns the unified diff of the working tree against `base`.
pub async fn working_diff(dir: &Path, base: &str) -> Result<String> {
    run_git(dir, &["diff", base]).await
}

/// Returns per-file change statistics against `base`, numstat style.
///
/// Binary files report "-" for their counts and are recorded as zero.
pub async fn file_changes(dir: &Path, base: &str) -> Result<Vec<FileDiff>> {
    let out = run_git(dir, &["diff", "--numstat", base]).await?;

    let changes = out
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 3 {
                Some(FileDiff {
                    path: parts[2].to_string(),
                    additions: parts[0].parse().unwrap_or(0),
                    deletions: parts[1].parse().unwrap_or(0),
                })
            } else {
                None
            }
        })
        .collect();

    Ok(changes)
}

/// Returns commits made since `base`, newest first.
pub async fn commits_since(dir: &Path, base: &str) -> Result<Vec<CommitRecord>> {
    let out = run_git(dir, &["log", &format!("{}..HEAD", base), "--oneline"]).await?;

    let commits = out
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut parts = line.splitn(2, ' ');
            CommitRecord {
                hash: parts.next().unwrap_or("").to_string(),
                message: parts.next().unwrap_or("").to_string(),
            }
        })
        .collect();

    Ok(commits)
}
