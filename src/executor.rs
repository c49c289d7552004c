//! Transformation executor implementations.
//!
//! Two interchangeable variants behind one call signature: an
//! instruction-driven agent CLI in headless mode, and a fixed
//! deterministic command. The controller and protocol never know which
//! variant a task uses.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::task::ExecutionSpec;

/// One (prompt, output) pair of accumulated conversation context.
///
/// The context list is append-only and passed by value into each
/// invocation, so every call is a pure function of accumulated history.
#[derive(Debug, Clone)]
pub struct ContextTurn {
    /// The instruction or steering prompt that drove the turn.
    pub prompt: String,
    /// The executor's raw output for that turn.
    pub output: String,
}

/// Request for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    /// The instruction for this turn (original, or a steering prompt).
    pub instruction: String,
    /// Accumulated (prompt, output) history from earlier turns.
    pub context: Vec<ContextTurn>,
    /// The repository clone to operate on.
    pub working_dir: PathBuf,
}

/// Outcome of one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutorOutcome {
    /// Whether the executor process exited successfully.
    pub success: bool,
    /// Exit code (None when the process was killed by a signal).
    pub exit_code: Option<i32>,
    /// Raw captured output (stdout and stderr lines, in arrival order).
    pub raw_output: String,
    /// Files modified in the working directory, per `git status`.
    pub files_changed: Vec<String>,
}

/// Trait for transformation executors.
#[async_trait]
pub trait TransformExecutor: Send + Sync {
    /// Runs the transformation in the request's working directory.
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorOutcome>;

    /// Returns the name of this executor.
    fn name(&self) -> &str;
}

/// Builds the executor configured by an execution spec.
pub fn executor_for_spec(spec: &ExecutionSpec) -> Box<dyn TransformExecutor> {
    match spec {
        ExecutionSpec::Agentic { .. } => Box::new(AgentCliExecutor::new()),
        ExecutionSpec::Deterministic { command } => {
            Box::new(CommandExecutor::new(command.clone()))
        }
    }
}

/// Instruction-driven executor shelling out to a headless agent CLI.
pub struct AgentCliExecutor {
    /// Path to the agent CLI binary.
    cli_path: String,
    /// Model to use, if the CLI supports selection.
    model: Option<String>,
}

impl Default for AgentCliExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentCliExecutor {
    /// Creates an executor using the default `claude` command.
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
            model: None,
        }
    }

    /// Creates an executor with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            model: None,
        }
    }

    /// Sets the model flag passed to the CLI.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builds the full prompt: accumulated history, then the new instruction.
    fn build_prompt(&self, request: &ExecutorRequest) -> String {
        if request.context.is_empty() {
            return request.instruction.clone();
        }

        let mut prompt = String::from(
            "You previously worked on this repository. Conversation so far:\n\n",
        );
        for turn in &request.context {
            prompt.push_str(&format!(
                "## Instruction\n{}\n\n## Your output\n{}\n\n",
                turn.prompt, turn.output
            ));
        }
        prompt.push_str(&format!("## New instruction\n{}", request.instruction));
        prompt
    }

    /// Builds the command arguments for a headless invocation.
    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(), // Non-interactive mode
            // The sandbox provides isolation, so permission prompts are skipped
            "--dangerously-skip-permissions".to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        args
    }
}

#[async_trait]
impl TransformExecutor for AgentCliExecutor {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorOutcome> {
        let prompt = self.build_prompt(&request);
        let args = self.build_args(&prompt);

        tracing::info!(
            cli = %self.cli_path,
            working_dir = ?request.working_dir,
            context_turns = request.context.len(),
            "spawning agent CLI"
        );

        let (status, raw_output) = run_captured(&self.cli_path, &args, &request.working_dir).await?;
        let files_changed = changed_files(&request.working_dir).await.unwrap_or_default();

        Ok(ExecutorOutcome {
            success: status.success(),
            exit_code: status.code(),
            raw_output,
            files_changed,
        })
    }

    fn name(&self) -> &str {
        "agent-cli"
    }
}

/// Deterministic executor running one fixed command via the shell.
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    /// Creates an executor for the given shell command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TransformExecutor for CommandExecutor {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorOutcome> {
        tracing::info!(
            command = %self.command,
            working_dir = ?request.working_dir,
            "running deterministic command"
        );

        let args = vec!["-c".to_string(), self.command.clone()];
        let (status, raw_output) = run_captured("sh", &args, &request.working_dir).await?;
        let files_changed = changed_files(&request.working_dir).await.unwrap_or_default();

        Ok(ExecutorOutcome {
            success: status.success(),
            exit_code: status.code(),
            raw_output,
            files_changed,
        })
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Spawns a process, streaming stdout and stderr line by line into one
/// captured transcript. Returns (exit status, transcript).
async fn run_captured(
    program: &str,
    args: &[String],
    working_dir: &PathBuf,
) -> Result<(std::process::ExitStatus, String)> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Pipeline(format!("failed to spawn {}: {}", program, e)))?;

    let stdout = child.stdout.take().ok_or_else(|| {
        Error::Pipeline(format!("stdout was not piped for {}", program))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        Error::Pipeline(format!("stderr was not piped for {}", program))
    })?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();

    let mut transcript = String::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        tracing::debug!(line = %line, "executor stdout");
                        transcript.push_str(&line);
                        transcript.push('\n');
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => return Err(Error::Pipeline(format!("stdout read failed: {}", e))),
                }
            }
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        tracing::debug!(line = %line, "executor stderr");
                        transcript.push_str(&line);
                        transcript.push('\n');
                    }
                    Ok(None) => stderr_done = true,
                    Err(e) => return Err(Error::Pipeline(format!("stderr read failed: {}", e))),
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Pipeline(format!("failed to wait for {}: {}", program, e)))?;

    Ok((status, transcript))
}

/// Lists modified and untracked files per `git status --porcelain`.
pub async fn changed_files(working_dir: &PathBuf) -> Result<Vec<String>> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(working_dir)
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git status: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!("git status failed: {}", stderr)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let files = stdout
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| line[3..].trim().to_string())
        .collect();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn create_test_repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        StdCommand::new("git")
            .args(["init"])
            .current_dir(temp.path())
            .output()
            .unwrap();
        std::fs::write(temp.path().join("README.md"), "# Test").unwrap();
        temp
    }

    #[tokio::test]
    async fn command_executor_captures_output() {
        let repo = create_test_repo();
        let executor = CommandExecutor::new("echo hello && echo oops >&2");

        let outcome = executor
            .execute(ExecutorRequest {
                instruction: String::new(),
                context: vec![],
                working_dir: repo.path().to_path_buf(),
            })
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.raw_output.contains("hello"));
        assert!(outcome.raw_output.contains("oops"));
    }

    #[tokio::test]
    async fn command_executor_reports_failure() {
        let repo = create_test_repo();
        let executor = CommandExecutor::new("exit 3");

        let outcome = executor
            .execute(ExecutorRequest {
                instruction: String::new(),
                context: vec![],
                working_dir: repo.path().to_path_buf(),
            })
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn command_executor_lists_changed_files() {
        let repo = create_test_repo();
        let executor = CommandExecutor::new("echo changed > generated.txt");

        let outcome = executor
            .execute(ExecutorRequest {
                instruction: String::new(),
                context: vec![],
                working_dir: repo.path().to_path_buf(),
            })
            .await
            .unwrap();

        assert!(outcome
            .files_changed
            .iter()
            .any(|f| f == "generated.txt"));
    }

    #[test]
    fn agent_prompt_includes_accumulated_context() {
        let executor = AgentCliExecutor::new();
        let request = ExecutorRequest {
            instruction: "also fix the tests".to_string(),
            context: vec![ContextTurn {
                prompt: "migrate the logger".to_string(),
                output: "migrated 3 call sites".to_string(),
            }],
            working_dir: PathBuf::from("/tmp"),
        };

        let prompt = executor.build_prompt(&request);
        assert!(prompt.contains("migrate the logger"));
        assert!(prompt.contains("migrated 3 call sites"));
        assert!(prompt.contains("also fix the tests"));
    }

    #[test]
    fn agent_prompt_without_context_is_the_instruction() {
        let executor = AgentCliExecutor::new();
        let request = ExecutorRequest {
            instruction: "migrate the logger".to_string(),
            context: vec![],
            working_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(executor.build_prompt(&request), "migrate the logger");
    }

    #[test]
    fn agent_args_include_model_when_set() {
        let executor = AgentCliExecutor::with_cli_path("claude").with_model("sonnet");
        let args = executor.build_args("do the thing");
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"sonnet".to_string()));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn executor_for_spec_picks_the_variant() {
        let agentic = executor_for_spec(&ExecutionSpec::Agentic {
            instruction: "x".to_string(),
            verifiers: vec![],
        });
        assert_eq!(agentic.name(), "agent-cli");

        let deterministic = executor_for_spec(&ExecutionSpec::Deterministic {
            command: "true".to_string(),
        });
        assert_eq!(deterministic.name(), "command");
    }
}
