//! # SiteKeeper Error Taxonomy
//!
//! One enum per failure class named in the error handling design (§7):
//! `Validation`, `Conflict`, `TransportDisconnected`, `Timeout`,
//! `JournalIo`, `InvariantViolation`, `HandlerFailed`. Each variant carries
//! enough context to reconstruct the short, user-visible `message` every
//! terminal outcome must carry.

use uuid::Uuid;

/// Result alias used throughout the workspace.
pub type SiteKeeperResult<T> = Result<T, SiteKeeperError>;

#[derive(Debug, thiserror::Error)]
pub enum SiteKeeperError {
    /// Missing or invalid parameters for a handler. Never retried.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// A conflicting MasterAction is already running.
    #[error("conflicting action in progress: {reason}")]
    Conflict { reason: String },

    /// The transport to a node could not deliver a message.
    #[error("transport disconnected for node '{node_name}': {reason}")]
    TransportDisconnected { node_name: String, reason: String },

    /// A readiness, execution, cancel-grace, or log-flush timeout elapsed.
    #[error("{phase} timed out after {elapsed_secs}s")]
    Timeout { phase: String, elapsed_secs: u64 },

    /// The Journal failed to read or write an on-disk artifact.
    #[error("journal I/O error during {operation}: {reason}")]
    JournalIo { operation: String, reason: String },

    /// A state machine or bookkeeping invariant was violated.
    #[error("invariant violation in {component}: {detail}")]
    InvariantViolation { component: String, detail: String },

    /// An ActionHandler's `execute` future returned an error or panicked.
    #[error("handler failed for action {master_action_id}: {reason}")]
    HandlerFailed {
        master_action_id: Uuid,
        reason: String,
    },

    /// No ActionHandler is registered for the requested OperationType.
    #[error("no handler registered for operation type '{operation_type}'")]
    UnknownOperationType { operation_type: String },

    /// Requested entity does not exist (MasterAction, NodeAction, stage...).
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SiteKeeperError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invariant(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            component: component.into(),
            detail: detail.into(),
        }
    }

    /// Short, user-visible message for a terminal outcome (§7: "every
    /// terminal outcome carries a short message").
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

impl From<std::io::Error> for SiteKeeperError {
    fn from(err: std::io::Error) -> Self {
        Self::JournalIo {
            operation: "io".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SiteKeeperError {
    fn from(err: serde_json::Error) -> Self {
        Self::JournalIo {
            operation: "serde_json".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_is_short_and_stable() {
        let err = SiteKeeperError::Timeout {
            phase: "readiness".to_string(),
            elapsed_secs: 30,
        };
        assert_eq!(err.user_message(), "readiness timed out after 30s");
    }

    #[test]
    fn validation_helper_builds_variant() {
        let err = SiteKeeperError::validation("missing field 'target'");
        assert!(matches!(err, SiteKeeperError::Validation { .. }));
    }
}
