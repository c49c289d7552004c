//! Local sandbox: a directory per group with a spawned agent process.
//!
//! Isolation here is a working directory boundary, not a container; the
//! provider exists so local runs and tests exercise the same
//! provision/exchange/teardown lifecycle a pod-backed provider would.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::agent::{PROTOCOL_SUBDIR, WORKSPACE_SUBDIR};
use crate::error::{Error, Result};
use crate::protocol::ProtocolStore;

use super::provider::{ResourceSpec, SandboxHandle, SandboxProvider};

/// A sandbox rooted in a local directory, hosting one agent process.
pub struct LocalSandbox {
    id: String,
    dir: PathBuf,
    store: ProtocolStore,
    agent: Option<Child>,
    destroyed: bool,
}

#[async_trait]
impl SandboxHandle for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> &ProtocolStore {
        &self.store
    }

    async fn start_agent(&mut self) -> Result<()> {
        let exe = std::env::current_exe().map_err(|e| {
            Error::Provisioning {
                group: self.id.clone(),
                reason: format!("cannot locate agent binary: {}", e),
            }
        })?;

        let child = Command::new(exe)
            .arg("agent")
            .arg(&self.dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Provisioning {
                group: self.id.clone(),
                reason: format!("failed to spawn agent process: {}", e),
            })?;

        tracing::info!(sandbox = %self.id, dir = ?self.dir, "started sandbox agent");
        self.agent = Some(child);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }

        if let Some(mut child) = self.agent.take() {
            // The agent may already have exited; a kill failure then is fine.
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(|e| Error::SandboxCleanup {
                path: self.dir.clone(),
                reason: e.to_string(),
            })?;
        }

        tracing::info!(sandbox = %self.id, "destroyed sandbox");
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        if !self.destroyed && self.dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                tracing::error!(error = %e, path = ?self.dir, "failed to clean up sandbox on drop");
            }
        }
    }
}

/// Provider that creates local directory sandboxes.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    base_dir: Option<PathBuf>,
}

impl Default for LocalSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSandboxProvider {
    /// Creates a provider rooted in the system temp directory.
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    /// Creates a provider rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn base(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("armada-sandboxes"),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    type Handle = LocalSandbox;

    async fn provision(&self, group: &str, _resources: &ResourceSpec) -> Result<Self::Handle> {
        let short = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", group, &short[..8]);
        let dir = self.base().join(&id);

        std::fs::create_dir_all(dir.join(WORKSPACE_SUBDIR)).map_err(|e| Error::Provisioning {
            group: group.to_string(),
            reason: format!("failed to create sandbox directory: {}", e),
        })?;
        let store = ProtocolStore::open(dir.join(PROTOCOL_SUBDIR))?;

        tracing::info!(sandbox = %id, dir = ?dir, "provisioned local sandbox");

        Ok(LocalSandbox {
            id,
            dir,
            store,
            agent: None,
            destroyed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn provision_creates_protocol_and_workspace_dirs() {
        let base = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::with_base_dir(base.path());

        let sandbox = provider
            .provision("batch-a", &ResourceSpec::default())
            .await
            .unwrap();

        assert!(sandbox.id().starts_with("batch-a-"));
        assert!(sandbox.protocol().dir().exists());
        assert!(sandbox.protocol().dir().ends_with(PROTOCOL_SUBDIR));
    }

    #[tokio::test]
    async fn destroy_removes_the_sandbox_and_is_idempotent() {
        let base = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::with_base_dir(base.path());

        let mut sandbox = provider
            .provision("batch-a", &ResourceSpec::default())
            .await
            .unwrap();
        let dir = sandbox.protocol().dir().parent().unwrap().to_path_buf();
        assert!(dir.exists());

        sandbox.destroy().await.unwrap();
        assert!(!dir.exists());

        sandbox.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn sandboxes_for_the_same_group_get_distinct_ids() {
        let base = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::with_base_dir(base.path());

        let a = provider
            .provision("batch-a", &ResourceSpec::default())
            .await
            .unwrap();
        let b = provider
            .provision("batch-a", &ResourceSpec::default())
            .await
            .unwrap();

        assert_ne!(a.id(), b.id());
    }
}
