//! Error types for the control plane

use thiserror::Error;

/// Result type for control-plane operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors raised by the control plane.
///
/// Variants map onto the failure classes the scheduler and controller care
/// about: transient I/O is retried with backoff, conflicts are re-read and
/// retried, invalid transitions are fatal for the action, capacity
/// exhaustion raises a scale-up signal, contract violations quarantine the
/// affected entity, and configuration errors refuse startup.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Transient I/O failure (network, 5xx, timeout)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Optimistic-concurrency conflict on a coordination-store key
    #[error("revision conflict on {key}")]
    Conflict { key: String },

    /// Illegal state-machine transition
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// No worker can satisfy the request; the instance stays pending
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Port allocation lost the CAS race beyond its retry bound
    #[error("port allocation conflict on worker {worker_id}")]
    PortAllocationConflict { worker_id: String },

    /// External collaborator returned malformed or impossible data
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Entity lookup failed
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Document-store persistence error
    #[error("storage error: {0}")]
    Storage(String),

    /// Lease expired or was revoked while an operation held it
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Internal invariant failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Whether the action should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlError::Transient(_) | ControlError::Storage(_))
    }

    /// Whether the action should be re-read and re-attempted immediately.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ControlError::Conflict { .. } | ControlError::PortAllocationConflict { .. }
        )
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Transient(err.to_string())
    }
}

impl From<sled::Error> for ControlError {
    fn from(err: sled::Error) -> Self {
        ControlError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::ContractViolation(format!("malformed document: {}", err))
    }
}
