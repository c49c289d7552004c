//! Sandbox provider and handle traits.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::ProtocolStore;

fn default_provisioning_window() -> Duration {
    Duration::from_secs(60)
}

/// Resource and timing parameters for provisioning a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU limit, in cores. `None` leaves the provider default.
    #[serde(default)]
    pub cpus: Option<f32>,
    /// Memory limit, in megabytes. `None` leaves the provider default.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// How long the controller waits for the sandbox's agent to publish
    /// its first status before concluding provisioning failed.
    #[serde(default = "default_provisioning_window")]
    pub provisioning_window: Duration,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: None,
            memory_mb: None,
            provisioning_window: default_provisioning_window(),
        }
    }
}

impl ResourceSpec {
    /// Sets the provisioning window.
    pub fn with_provisioning_window(mut self, window: Duration) -> Self {
        self.provisioning_window = window;
        self
    }
}

/// An active isolated environment bound to one group.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Unique sandbox identifier, stable across controller instances.
    fn id(&self) -> &str;

    /// Protocol store rooted in this sandbox's file exchange directory.
    fn protocol(&self) -> &ProtocolStore;

    /// Starts the agent process inside the sandbox.
    async fn start_agent(&mut self) -> Result<()>;

    /// Tears the sandbox down. Idempotent; the controller calls this
    /// unconditionally, including on error paths.
    async fn destroy(&mut self) -> Result<()>;
}

/// Provider for creating sandboxed environments.
///
/// Used only by the controller, never by the agent.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// The type of sandbox this provider creates.
    type Handle: SandboxHandle;

    /// Provisions a fresh sandbox for the named group.
    async fn provision(&self, group: &str, resources: &ResourceSpec) -> Result<Self::Handle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_spec_defaults_to_a_minute_window() {
        let spec = ResourceSpec::default();
        assert_eq!(spec.provisioning_window, Duration::from_secs(60));
        assert!(spec.cpus.is_none());
        assert!(spec.memory_mb.is_none());
    }

    #[test]
    fn resource_spec_roundtrips_with_defaults() {
        let json = r#"{"cpus": 2.0}"#;
        let spec: ResourceSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.cpus, Some(2.0));
        assert_eq!(spec.provisioning_window, Duration::from_secs(60));
    }
}
