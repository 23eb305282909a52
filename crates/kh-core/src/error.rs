use uuid::Uuid;

use crate::store::StoreError;

/// Error taxonomy shared by the engine, scheduler, and session crates.
///
/// Categories map one-to-one onto how the caller must react: `Validation`,
/// `NotFound`, and `Conflict` surface directly; `TransientStore` is retried
/// with backoff inside the scheduler and ingest paths; `AgentUnreachable`
/// never reaches a caller (the task moves to reconnect-pending instead).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bad input: unknown attack mode, empty hashlist, out-of-range
    /// priority or chunk size, mode-9 precondition failures. Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A state-machine violation, e.g. retrying a running job.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Keyspace arithmetic exceeded the representable maximum.
    #[error("keyspace overflow: {0}")]
    KeyspaceOverflow(String),

    /// Store timeout or deadlock; retried with bounded backoff before
    /// being surfaced.
    #[error("transient store failure: {0}")]
    TransientStore(String),

    /// Sending to an agent failed.
    #[error("agent {agent_id} unreachable")]
    AgentUnreachable { agent_id: Uuid },

    /// A benchmark probe exhausted its time budget.
    #[error("benchmark failed: {0}")]
    BenchmarkFailed(String),

    /// A crack batch rolled back; the agent will retransmit.
    #[error("partial ingest: {0}")]
    PartialIngest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Store contention worth retrying with backoff before surfacing.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Store(store) => store.is_transient(),
            CoreError::TransientStore(_) => true,
            _ => false,
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
