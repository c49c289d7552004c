//! Verifier command execution.
//!
//! Runs the task's named verifier commands inside a repository clone and
//! captures exit code and output per verifier. A failing verifier is a
//! captured outcome, never an error.

use std::path::Path;

use tokio::process::Command;

use crate::protocol::VerifierOutcome;

/// Runs verifier command lists inside sandbox clones.
#[derive(Debug, Clone, Default)]
pub struct VerifierRunner;

impl VerifierRunner {
    /// Creates a verifier runner.
    pub fn new() -> Self {
        Self
    }

    /// Runs every command in order, capturing each outcome.
    ///
    /// Commands after a failing one still run; the caller decides what a
    /// failure means for the pipeline.
    pub async fn run_all(&self, commands: &[String], dir: &Path) -> Vec<VerifierOutcome> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            outcomes.push(self.run_one(command, dir).await);
        }
        outcomes
    }

    /// Runs one verifier via the shell.
    async fn run_one(&self, command: &str, dir: &Path) -> VerifierOutcome {
        tracing::debug!(command = %command, dir = ?dir, "running verifier");

        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                VerifierOutcome {
                    command: command.to_string(),
                    exit_code: output.status.code(),
                    output: text,
                }
            }
            Err(e) => VerifierOutcome {
                command: command.to_string(),
                exit_code: None,
                output: format!("failed to spawn verifier: {}", e),
            },
        }
    }
}
