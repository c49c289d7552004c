//! Atomic file exchange for protocol messages.
//!
//! Every write is a full-file replace: serialize to a temp file in the
//! same directory, then rename over the target. A concurrent reader
//! never observes a partially-written file. A missing file means
//! "not started", never an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::messages::{AgentPhase, Manifest, ResultFile, StatusFile, SteeringInstruction};

/// File name of the controller-written group manifest.
pub const MANIFEST_FILE: &str = "manifest.json";
/// File name of the agent's frequently overwritten status.
pub const STATUS_FILE: &str = "status.json";
/// File name of the agent's structured results.
pub const RESULT_FILE: &str = "result.json";
/// File name of the controller's steering instruction.
pub const STEERING_FILE: &str = "steering.json";

/// Owns the protocol directory inside a sandbox and the atomic
/// read/write/consume operations over it.
///
/// Clones share one status lock, so in-process writers of the status
/// file (the agent's state machine and its liveness refresher) cannot
/// interleave a read-modify-write with a phase transition.
#[derive(Debug, Clone)]
pub struct ProtocolStore {
    dir: PathBuf,
    status_lock: Arc<Mutex<()>>,
}

impl ProtocolStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            status_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Returns the protocol directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically replaces `name` with the serialized value.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Protocol(format!("failed to serialize {}: {}", name, e)))?;

        // Temp file in the same directory so the rename stays atomic.
        let tmp = self.dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }

    /// Reads and parses `name`, or returns `None` when it does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Protocol(format!("failed to parse {}: {}", name, e)))?;
        Ok(Some(value))
    }

    /// Removes `name` from the exchange and returns its contents, so the
    /// writer can treat file absence as acknowledgment.
    ///
    /// The claim is a rename, not a read-then-delete: a writer replacing
    /// the file concurrently leaves its newer version in place to be
    /// consumed on the next poll instead of deleting it unread.
    pub fn consume_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        let claimed = self
            .dir
            .join(format!(".{}.{}.consumed", name, Uuid::new_v4()));

        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let bytes = fs::read(&claimed);
        let _ = fs::remove_file(&claimed);

        let value = serde_json::from_slice(&bytes?)
            .map_err(|e| Error::Protocol(format!("failed to parse {}: {}", name, e)))?;
        Ok(Some(value))
    }

    /// True when `name` is absent.
    pub fn is_absent(&self, name: &str) -> bool {
        !self.dir.join(name).exists()
    }

    /// Writes the group manifest.
    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        self.write_json(MANIFEST_FILE, manifest)
    }

    /// Reads the group manifest, if written yet.
    pub fn read_manifest(&self) -> Result<Option<Manifest>> {
        self.read_json(MANIFEST_FILE)
    }

    /// Overwrites the agent status.
    pub fn write_status(&self, status: &StatusFile) -> Result<()> {
        let _guard = self
            .status_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.write_json(STATUS_FILE, status)
    }

    /// Reads the agent status, if written yet.
    pub fn read_status(&self) -> Result<Option<StatusFile>> {
        self.read_json(STATUS_FILE)
    }

    /// Re-stamps the current status so a long-running phase keeps a
    /// fresh timestamp. `awaiting_input` and terminal statuses are left
    /// alone: their timestamp is the clock inactivity and terminal
    /// detection are measured against.
    pub fn refresh_active_status(&self) -> Result<()> {
        let _guard = self
            .status_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(mut status) = self.read_json::<StatusFile>(STATUS_FILE)? else {
            return Ok(());
        };
        if status.phase == AgentPhase::AwaitingInput || status.phase.is_terminal() {
            return Ok(());
        }
        status.updated_at = chrono::Utc::now().to_rfc3339();
        self.write_json(STATUS_FILE, &status)
    }

    /// Overwrites the structured results.
    pub fn write_result(&self, result: &ResultFile) -> Result<()> {
        self.write_json(RESULT_FILE, result)
    }

    /// Reads the structured results, if written yet.
    pub fn read_result(&self) -> Result<Option<ResultFile>> {
        self.read_json(RESULT_FILE)
    }

    /// Writes (or supersedes) the steering instruction.
    pub fn write_instruction(&self, instruction: &SteeringInstruction) -> Result<()> {
        self.write_json(STEERING_FILE, instruction)
    }

    /// Consumes the steering instruction: read, then delete before acting.
    pub fn consume_instruction(&self) -> Result<Option<SteeringInstruction>> {
        self.consume_json(STEERING_FILE)
    }

    /// True once a written instruction has been consumed by the agent.
    pub fn instruction_acknowledged(&self) -> bool {
        self.is_absent(STEERING_FILE)
    }
}
