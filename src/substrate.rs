//! Durable execution substrate contract.
//!
//! The controller holds no authoritative state of its own: every wait it
//! performs goes through this trait so a crashed controller instance can
//! be resumed by another against the same sandbox files and the same
//! signal history. The in-process implementation backs local runs and
//! tests with tokio channels; a production deployment would bind these
//! operations to a workflow engine's timers, signals, and queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::progress::ExecutionProgress;
use crate::protocol::{AgentPhase, ResultFile};

/// A human decision for a group sitting in the approval loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanDecision {
    /// Apply a mid-flight correction and re-run the pipeline.
    Steer { prompt: String },
    /// Proceed to finalization.
    Approve,
    /// Discard the work.
    Reject,
    /// Discard the work.
    Cancel,
}

/// A human decision for a task paused on its failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDecision {
    /// Resume launching the remaining groups.
    Continue,
    /// Mark all not-yet-started groups skipped and finish now.
    SkipRemaining,
    /// Treat the whole task as cancelled.
    Cancel,
}

/// Cached view of one group's latest protocol state, published for
/// synchronous external queries (diffs, verifier output, steering
/// history).
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    /// Group name.
    pub group: String,
    /// Phase the controller last observed.
    pub phase: AgentPhase,
    /// Latest structured results, when the agent has written any.
    pub result: Option<ResultFile>,
    /// RFC 3339 timestamp of the observed status.
    pub updated_at: String,
}

/// Contract required of the durable-execution substrate.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Liveness signal reported on every poll, so a multi-minute wait is
    /// not mistaken for a stalled unit of execution.
    async fn heartbeat(&self, group: &str);

    /// Durable timer; resumable from any controller instance.
    async fn sleep(&self, duration: Duration);

    /// Waits up to `timeout` for a human decision addressed to `group`.
    /// Returns `None` when the window expires without one.
    async fn wait_for_decision(&self, group: &str, timeout: Duration) -> Option<HumanDecision>;

    /// Waits, unbounded, for a decision on a threshold-paused task.
    async fn wait_for_pause_decision(&self) -> PauseDecision;

    /// Publishes a progress snapshot for synchronous queries.
    async fn publish_progress(&self, task_id: &str, progress: ExecutionProgress);

    /// Publishes a group snapshot for synchronous queries.
    async fn publish_snapshot(&self, snapshot: GroupSnapshot);
}

type DecisionRx = Arc<Mutex<mpsc::UnboundedReceiver<HumanDecision>>>;

struct SubstrateInner {
    decision_senders: Mutex<HashMap<String, mpsc::UnboundedSender<HumanDecision>>>,
    decision_receivers: Mutex<HashMap<String, DecisionRx>>,
    pause_tx: mpsc::UnboundedSender<PauseDecision>,
    pause_rx: Mutex<mpsc::UnboundedReceiver<PauseDecision>>,
    progress: RwLock<HashMap<String, ExecutionProgress>>,
    snapshots: RwLock<HashMap<String, GroupSnapshot>>,
    heartbeats: RwLock<HashMap<String, u64>>,
}

/// In-process substrate over tokio channels.
///
/// Clones share one underlying state, so a test or an embedding CLI can
/// keep a handle for signalling and queries while the controller runs.
#[derive(Clone)]
pub struct InProcessSubstrate {
    inner: Arc<SubstrateInner>,
}

impl Default for InProcessSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessSubstrate {
    /// Creates an empty in-process substrate.
    pub fn new() -> Self {
        let (pause_tx, pause_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SubstrateInner {
                decision_senders: Mutex::new(HashMap::new()),
                decision_receivers: Mutex::new(HashMap::new()),
                pause_tx,
                pause_rx: Mutex::new(pause_rx),
                progress: RwLock::new(HashMap::new()),
                snapshots: RwLock::new(HashMap::new()),
                heartbeats: RwLock::new(HashMap::new()),
            }),
        }
    }

    async fn decision_rx(&self, group: &str) -> DecisionRx {
        let mut receivers = self.inner.decision_receivers.lock().await;
        if let Some(rx) = receivers.get(group) {
            return rx.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        receivers.insert(group.to_string(), rx.clone());
        self.inner
            .decision_senders
            .lock()
            .await
            .insert(group.to_string(), tx);
        rx
    }

    /// Delivers a human decision to the named group's approval loop.
    pub async fn signal_decision(&self, group: &str, decision: HumanDecision) {
        // Materializes the channel so signals sent before the waiter
        // arrives are queued, not dropped.
        self.decision_rx(group).await;
        if let Some(tx) = self.inner.decision_senders.lock().await.get(group) {
            let _ = tx.send(decision);
        }
    }

    /// Delivers a decision to a threshold-paused task.
    pub fn signal_pause_decision(&self, decision: PauseDecision) {
        let _ = self.inner.pause_tx.send(decision);
    }

    /// Latest published progress for a task.
    pub async fn progress(&self, task_id: &str) -> Option<ExecutionProgress> {
        self.inner.progress.read().await.get(task_id).cloned()
    }

    /// Latest published snapshot for a group.
    pub async fn snapshot(&self, group: &str) -> Option<GroupSnapshot> {
        self.inner.snapshots.read().await.get(group).cloned()
    }

    /// Count of heartbeats reported for a group.
    pub async fn heartbeat_count(&self, group: &str) -> u64 {
        self.inner
            .heartbeats
            .read()
            .await
            .get(group)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Substrate for InProcessSubstrate {
    async fn heartbeat(&self, group: &str) {
        *self
            .inner
            .heartbeats
            .write()
            .await
            .entry(group.to_string())
            .or_insert(0) += 1;
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn wait_for_decision(&self, group: &str, timeout: Duration) -> Option<HumanDecision> {
        let rx = self.decision_rx(group).await;
        let mut rx = rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(decision)) => Some(decision),
            // Sender dropped or window expired: the caller treats both
            // as inactivity.
            Ok(None) | Err(_) => None,
        }
    }

    async fn wait_for_pause_decision(&self) -> PauseDecision {
        let mut rx = self.inner.pause_rx.lock().await;
        match rx.recv().await {
            Some(decision) => decision,
            // The substrate holds its own sender, so this is unreachable
            // in practice; pend rather than invent a decision.
            None => std::future::pending().await,
        }
    }

    async fn publish_progress(&self, task_id: &str, progress: ExecutionProgress) {
        self.inner
            .progress
            .write()
            .await
            .insert(task_id.to_string(), progress);
    }

    async fn publish_snapshot(&self, snapshot: GroupSnapshot) {
        self.inner
            .snapshots
            .write()
            .await
            .insert(snapshot.group.clone(), snapshot);
    }
}
