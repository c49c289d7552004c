//! Task controller: the durable state machine driving a task.
//!
//! The controller holds no authoritative state. Group progress lives in
//! sandbox protocol files and human signals live in the substrate, so a
//! controller instance that crashes mid-poll is replaced by another that
//! resumes the same waits against the same sandbox and observes the same
//! files.

mod group;
mod scheduler;
mod steering;

use std::sync::Arc;
use std::time::Duration;

use crate::notify::{LogNotifier, Notifier};
use crate::sandbox::{ResourceSpec, SandboxProvider};
use crate::substrate::Substrate;

fn default_decision_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

/// Controller timing and resource configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between agent status polls.
    pub status_poll_interval: Duration,
    /// How long an unchanged status may sit before the sandbox is
    /// declared unreachable.
    pub staleness_window: Duration,
    /// Human inactivity window in the approval loop; expiry resolves to
    /// cancellation, never an unbounded wait.
    pub decision_timeout: Duration,
    /// Resource and provisioning parameters passed to the provider.
    pub resources: ResourceSpec,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_millis(500),
            staleness_window: Duration::from_secs(120),
            decision_timeout: default_decision_timeout(),
            resources: ResourceSpec::default(),
        }
    }
}

/// Drives one task from submission to its terminal result, one sandbox
/// per group.
pub struct TaskController<P, S> {
    pub(crate) provider: Arc<P>,
    pub(crate) substrate: Arc<S>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: ControllerConfig,
}

impl<P, S> TaskController<P, S>
where
    P: SandboxProvider + 'static,
    P::Handle: 'static,
    S: Substrate + 'static,
{
    /// Creates a controller over the given provider and substrate.
    pub fn new(provider: P, substrate: S) -> Self {
        Self {
            provider: Arc::new(provider),
            substrate: Arc::new(substrate),
            notifier: Arc::new(LogNotifier::new()),
            config: ControllerConfig::default(),
        }
    }

    /// Overrides the timing configuration.
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the notification channel.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
