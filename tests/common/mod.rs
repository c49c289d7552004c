//! Shared fixtures: scripted sandboxes for scheduler tests, an
//! in-process agent sandbox for steering tests, and recording doubles.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command as StdCommand;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use armada::agent::PROTOCOL_SUBDIR;
use armada::{
    AgentConfig, AgentPhase, ControllerConfig, Error, Finalizer, Notifier, NotifyEvent,
    ProtocolStore, RepoResult, ResourceSpec, Result, ResultFile, SandboxAgent, SandboxHandle,
    SandboxProvider, StatusFile, SteeringState, RepoWorkspace,
};

/// Controller config tuned for fast tests.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        status_poll_interval: Duration::from_millis(20),
        staleness_window: Duration::from_secs(5),
        decision_timeout: Duration::from_secs(60),
        resources: ResourceSpec::default().with_provisioning_window(Duration::from_secs(5)),
    }
}

/// Creates a committed local git repository usable as a clone origin.
pub fn create_origin_repo() -> TempDir {
    let temp = TempDir::new().expect("failed to create temp dir");
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
    ] {
        StdCommand::new("git")
            .args(&args)
            .current_dir(temp.path())
            .output()
            .expect("git setup failed");
    }
    std::fs::write(temp.path().join("README.md"), "# Origin\n").unwrap();
    StdCommand::new("git")
        .args(["add", "."])
        .current_dir(temp.path())
        .output()
        .unwrap();
    StdCommand::new("git")
        .args(["commit", "-m", "initial"])
        .current_dir(temp.path())
        .output()
        .unwrap();
    temp
}

/// Notifier that records every event for later assertions.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub events: Arc<StdMutex<Vec<NotifyEvent>>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotifyEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl RecordingNotifier {
    pub fn steering_rejections(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, NotifyEvent::SteeringRejected { .. }))
            .count()
    }
}

/// Finalizer that counts publishes instead of opening pull requests.
pub struct StubFinalizer {
    pub publishes: Arc<AtomicUsize>,
}

#[async_trait]
impl Finalizer for StubFinalizer {
    async fn publish(
        &self,
        repo: &RepoWorkspace,
        _title: &str,
        _body: &str,
    ) -> Result<Option<String>> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("stub://pr/{}", repo.name)))
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// What a scripted sandbox's fake agent does after launch.
#[derive(Debug, Clone, Copy)]
pub enum AgentScript {
    /// Run for `delay`, then complete.
    Succeed { delay: Duration },
    /// Run for `delay`, then fail with a diagnostic.
    Fail { delay: Duration },
    /// Never write any status (provisioning never finishes).
    Silent,
    /// Write one status, then go quiet (stale sandbox).
    StallAfterStart,
}

/// Sandbox provider whose agents follow per-group scripts instead of
/// running real pipelines. Tracks concurrency so scheduling invariants
/// can be asserted.
pub struct ScriptedProvider {
    base: PathBuf,
    scripts: HashMap<String, AgentScript>,
    default_script: AgentScript,
    pub running: Arc<AtomicUsize>,
    pub max_running: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(base: impl Into<PathBuf>, default_script: AgentScript) -> Self {
        Self {
            base: base.into(),
            scripts: HashMap::new(),
            default_script,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_script(mut self, group: &str, script: AgentScript) -> Self {
        self.scripts.insert(group.to_string(), script);
        self
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    type Handle = ScriptedSandbox;

    async fn provision(&self, group: &str, _resources: &ResourceSpec) -> Result<Self::Handle> {
        let id = format!("{}-{}", group, &Uuid::new_v4().simple().to_string()[..8]);
        let dir = self.base.join(&id);
        let store = ProtocolStore::open(&dir)?;
        let script = self
            .scripts
            .get(group)
            .copied()
            .unwrap_or(self.default_script);

        Ok(ScriptedSandbox {
            id,
            dir,
            store,
            script,
            running: self.running.clone(),
            max_running: self.max_running.clone(),
            task: None,
            destroyed: false,
        })
    }
}

pub struct ScriptedSandbox {
    id: String,
    dir: PathBuf,
    store: ProtocolStore,
    script: AgentScript,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    task: Option<tokio::task::JoinHandle<()>>,
    destroyed: bool,
}

#[async_trait]
impl SandboxHandle for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> &ProtocolStore {
        &self.store
    }

    async fn start_agent(&mut self) -> Result<()> {
        let store = self.store.clone();
        let script = self.script;
        let running = self.running.clone();
        let max_running = self.max_running.clone();

        self.task = Some(tokio::spawn(async move {
            let manifest = loop {
                match store.read_manifest() {
                    Ok(Some(manifest)) => break manifest,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            let group = manifest.group.name.clone();

            match script {
                AgentScript::Silent => {}
                AgentScript::StallAfterStart => {
                    let _ = store.write_status(&StatusFile::now(
                        AgentPhase::Executing,
                        "transforming",
                    ));
                }
                AgentScript::Succeed { delay } | AgentScript::Fail { delay } => {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);

                    let _ = store.write_status(&StatusFile::now(
                        AgentPhase::Executing,
                        "transforming",
                    ));
                    tokio::time::sleep(delay).await;

                    let mut repo = RepoResult::new("svc");
                    let (phase, step) = match script {
                        AgentScript::Succeed { .. } => {
                            repo.artifact = Some(format!("stub://pr/{}", group));
                            (AgentPhase::Complete, "finalization complete".to_string())
                        }
                        _ => {
                            repo.error = Some("verifier exited 1".to_string());
                            (AgentPhase::Failed, "verifier exited 1".to_string())
                        }
                    };
                    let _ = store.write_result(&ResultFile {
                        task_id: manifest.task_id.clone(),
                        group,
                        repos: vec![repo],
                        raw_output: String::new(),
                        steering: SteeringState::new(manifest.max_steering_iterations),
                    });
                    let _ = store.write_status(&StatusFile::now(phase, step));

                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }));

        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(Error::Io)?;
        }
        self.destroyed = true;
        Ok(())
    }
}

/// Sandbox provider that runs the real [`SandboxAgent`] as an in-process
/// task, with a stub finalizer so no pull requests leave the machine.
pub struct InProcessAgentProvider {
    base: PathBuf,
    pub publishes: Arc<AtomicUsize>,
}

impl InProcessAgentProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            publishes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SandboxProvider for InProcessAgentProvider {
    type Handle = InProcessAgentSandbox;

    async fn provision(&self, group: &str, _resources: &ResourceSpec) -> Result<Self::Handle> {
        let id = format!("{}-{}", group, &Uuid::new_v4().simple().to_string()[..8]);
        let dir = self.base.join(&id);
        let store = ProtocolStore::open(dir.join(PROTOCOL_SUBDIR))?;

        Ok(InProcessAgentSandbox {
            id,
            dir,
            store,
            publishes: self.publishes.clone(),
            task: None,
            destroyed: false,
        })
    }
}

pub struct InProcessAgentSandbox {
    id: String,
    dir: PathBuf,
    store: ProtocolStore,
    publishes: Arc<AtomicUsize>,
    task: Option<tokio::task::JoinHandle<Result<()>>>,
    destroyed: bool,
}

#[async_trait]
impl SandboxHandle for InProcessAgentSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> &ProtocolStore {
        &self.store
    }

    async fn start_agent(&mut self) -> Result<()> {
        let mut agent = SandboxAgent::new(&self.dir)?
            .with_config(AgentConfig {
                instruction_poll_interval: Duration::from_millis(25),
                manifest_wait: Duration::from_secs(5),
                status_refresh_interval: Duration::from_millis(250),
            })
            .with_finalizer(Box::new(StubFinalizer {
                publishes: self.publishes.clone(),
            }));

        self.task = Some(tokio::spawn(async move { agent.run().await }));
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(Error::Io)?;
        }
        self.destroyed = true;
        Ok(())
    }
}
