//! Control protocol between the task controller and sandbox agents.
//!
//! All protocol state is exchanged as whole-file JSON writes inside the
//! sandbox, so any controller instance can resume exactly where another
//! left off.

mod messages;
mod store;

pub use messages::{
    AgentPhase, CommitRecord, FileDiff, Manifest, RepoResult, ResultFile, SteeringAction,
    SteeringInstruction, StatusFile, VerifierOutcome,
};
pub use store::{
    ProtocolStore, MANIFEST_FILE, RESULT_FILE, STATUS_FILE, STEERING_FILE,
};
