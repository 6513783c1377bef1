//! Error types for the replication subsystem.

use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Backend read/write failure not covered by a more specific variant.
    #[error("backend error: {msg}")]
    Backend {
        /// Error message describing the issue.
        msg: String,
    },

    /// The backend aborted the write transaction because of a lock conflict.
    #[error("transaction deadlock")]
    Deadlock,

    /// The deadlock retry ceiling was reached for one entry.
    #[error("transaction deadlock persisted after {attempts} attempts")]
    DeadlockRetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Entry does not exist.
    #[error("no such object: {dn}")]
    NoSuchObject {
        /// DN that was looked up.
        dn: String,
    },

    /// Entry being added already exists under a different identity.
    #[error("entry already exists: {dn}")]
    EntryAlreadyExists {
        /// DN of the existing entry.
        dn: String,
    },

    /// Entry's parent is not (yet) present locally.
    #[error("parent of {dn} does not exist")]
    NoSuchParent {
        /// DN of the entry whose parent is missing.
        dn: String,
    },

    /// An attribute or value metadata record could not be parsed.
    #[error("malformed metadata: {msg}")]
    MalformedMetadata {
        /// Error message describing the malformed record.
        msg: String,
    },

    /// Incoming entry carried no attribute metadata at all.
    #[error("entry {dn} carries no replication metadata")]
    MissingMetadata {
        /// DN of the offending entry.
        dn: String,
    },

    /// The sync-done cookie could not be parsed.
    #[error("malformed cookie: {msg}")]
    MalformedCookie {
        /// Error message describing the malformed cookie.
        msg: String,
    },

    /// Partner rejected the offered credential.
    #[error("authentication to {partner} failed")]
    AuthFailed {
        /// Partner URI.
        partner: String,
    },

    /// Partner transport error.
    #[error("network error: {msg}")]
    NetworkError {
        /// Error message describing the network issue.
        msg: String,
    },

    /// Unknown replication agreement.
    #[error("unknown agreement: {id}")]
    AgreementUnknown {
        /// The unknown agreement identifier.
        id: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Replication engine was shut down.
    #[error("replication engine shut down")]
    Shutdown,
}

impl ReplError {
    /// Whether retrying the same work later in the cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplError::Deadlock | ReplError::NetworkError { .. } | ReplError::NoSuchParent { .. }
        )
    }

    /// Whether the error is an ambiguous conflict that is logged and skipped
    /// instead of aborting the page.
    pub fn is_unresolved_conflict(&self) -> bool {
        matches!(
            self,
            ReplError::EntryAlreadyExists { .. }
                | ReplError::MissingMetadata { .. }
                | ReplError::NoSuchParent { .. }
        )
    }

    /// Short stable code kept on a requeued page entry.
    pub fn code(&self) -> &'static str {
        match self {
            ReplError::Backend { .. } => "backend",
            ReplError::Deadlock => "deadlock",
            ReplError::DeadlockRetriesExhausted { .. } => "deadlock_exhausted",
            ReplError::NoSuchObject { .. } => "no_such_object",
            ReplError::EntryAlreadyExists { .. } => "already_exists",
            ReplError::NoSuchParent { .. } => "no_such_parent",
            ReplError::MalformedMetadata { .. } => "malformed_metadata",
            ReplError::MissingMetadata { .. } => "missing_metadata",
            ReplError::MalformedCookie { .. } => "malformed_cookie",
            ReplError::AuthFailed { .. } => "auth_failed",
            ReplError::NetworkError { .. } => "network",
            ReplError::AgreementUnknown { .. } => "unknown_agreement",
            ReplError::Serialization(_) => "serialization",
            ReplError::Io(_) => "io",
            ReplError::Shutdown => "shutdown",
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;
