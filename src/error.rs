//! Error types for the edit history store.
//!
//! Every failure is a variant of [`HistoryError`]. Callers never type-check
//! individual variants to decide what to do next; they ask for the
//! [`ErrorKind`] and consult its [`ErrorPolicy`].

use crate::types::EditId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Severity attached to integrity failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The stored hash is malformed or missing information; content may be fine.
    Warning,
    /// Reconstructed content does not match the stored hash.
    Critical,
}

/// Failures raised while rebuilding an edit from its chain.
#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("circular reference in {note_id}/{branch}: {edit_id} revisited while walking from {target}")]
    CircularReference {
        note_id: String,
        branch: String,
        target: EditId,
        edit_id: EditId,
    },

    #[error("chain for {target} in {note_id}/{branch} exceeds {max} hops without reaching a full edit")]
    ChainLength {
        note_id: String,
        branch: String,
        target: EditId,
        max: usize,
    },

    #[error("edit {missing} referenced by {referenced_by} is missing from {note_id}/{branch}")]
    MissingEdit {
        note_id: String,
        branch: String,
        missing: EditId,
        referenced_by: EditId,
    },

    #[error("broken chain at {edit_id} in {note_id}/{branch}: {reason}")]
    BrokenChain {
        note_id: String,
        branch: String,
        edit_id: EditId,
        reason: String,
    },

    #[error("failed to replay {edit_id} in {note_id}/{branch}: {source}")]
    PatchApplication {
        note_id: String,
        branch: String,
        edit_id: EditId,
        #[source]
        source: Box<HistoryError>,
    },
}

/// Main error type for history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Compression failure: {0}")]
    Security(String),

    #[error("State consistency error: {0}")]
    StateConsistency(String),

    #[error("Integrity mismatch for {edit_id}: expected {expected}, got {actual}")]
    Integrity {
        edit_id: EditId,
        expected: String,
        actual: String,
        severity: Severity,
    },

    #[error("Operation timed out after {after:?}: {operation}")]
    OperationTimeout { operation: String, after: Duration },

    #[error("Storage capacity exceeded: {0}")]
    Capacity(String),

    #[error("Lock contention: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),

    #[error("Store connection closed")]
    ConnectionClosed,

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Schema mismatch: store is at version {found}, supported up to {supported}")]
    SchemaMismatch { found: u32, supported: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<HistoryError>,
    },
}

/// Discriminant used for classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Security,
    StateConsistency,
    Integrity,
    OperationTimeout,
    Capacity,
    Concurrency,
    Reconstruction,
    ConnectionClosed,
    TransactionAborted,
    SchemaMismatch,
    NotFound,
    /// IO failure that may succeed on a second attempt.
    TransientIo,
    Io,
    Serialization,
    Corruption,
}

/// What callers are allowed to do about an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorPolicy {
    /// The operation may be retried as-is.
    pub retryable: bool,
    /// Derived state (caches, in-flight maps) should be discarded.
    pub requires_cleanup: bool,
    /// The integrity auditor may rewrite the record to fix it.
    pub healable: bool,
}

impl ErrorPolicy {
    const fn new(retryable: bool, requires_cleanup: bool, healable: bool) -> Self {
        Self {
            retryable,
            requires_cleanup,
            healable,
        }
    }
}

impl ErrorKind {
    /// Classification table shared by the store retry loop and the auditor.
    pub const fn policy(self) -> ErrorPolicy {
        match self {
            ErrorKind::Validation => ErrorPolicy::new(false, false, false),
            ErrorKind::Security => ErrorPolicy::new(false, false, false),
            ErrorKind::StateConsistency => ErrorPolicy::new(false, true, false),
            ErrorKind::Integrity => ErrorPolicy::new(false, false, true),
            ErrorKind::OperationTimeout => ErrorPolicy::new(true, false, false),
            ErrorKind::Capacity => ErrorPolicy::new(false, false, false),
            ErrorKind::Concurrency => ErrorPolicy::new(true, false, false),
            ErrorKind::Reconstruction => ErrorPolicy::new(false, true, false),
            ErrorKind::ConnectionClosed => ErrorPolicy::new(true, false, false),
            ErrorKind::TransactionAborted => ErrorPolicy::new(true, false, false),
            ErrorKind::SchemaMismatch => ErrorPolicy::new(false, false, false),
            ErrorKind::NotFound => ErrorPolicy::new(false, false, false),
            ErrorKind::TransientIo => ErrorPolicy::new(true, false, false),
            ErrorKind::Io => ErrorPolicy::new(false, false, false),
            ErrorKind::Serialization => ErrorPolicy::new(false, false, false),
            ErrorKind::Corruption => ErrorPolicy::new(false, true, false),
        }
    }
}

impl HistoryError {
    /// Classify this error. Context wrappers are transparent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HistoryError::Validation(_) => ErrorKind::Validation,
            HistoryError::Security(_) => ErrorKind::Security,
            HistoryError::StateConsistency(_) => ErrorKind::StateConsistency,
            HistoryError::Integrity { .. } => ErrorKind::Integrity,
            HistoryError::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            HistoryError::Capacity(_) => ErrorKind::Capacity,
            HistoryError::Concurrency(_) => ErrorKind::Concurrency,
            HistoryError::Reconstruction(_) => ErrorKind::Reconstruction,
            HistoryError::ConnectionClosed => ErrorKind::ConnectionClosed,
            HistoryError::TransactionAborted(_) => ErrorKind::TransactionAborted,
            HistoryError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            HistoryError::NotFound(_) => ErrorKind::NotFound,
            HistoryError::Io(e) => match e.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    ErrorKind::TransientIo
                }
                io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge => ErrorKind::Capacity,
                _ => ErrorKind::Io,
            },
            HistoryError::Serialization(_) => ErrorKind::Serialization,
            HistoryError::Corruption(_) => ErrorKind::Corruption,
            HistoryError::Context { source, .. } => source.kind(),
        }
    }

    /// Policy for this error's kind.
    pub fn policy(&self) -> ErrorPolicy {
        self.kind().policy()
    }

    pub fn is_retryable(&self) -> bool {
        self.policy().retryable
    }

    /// Strip context wrappers.
    pub fn root(&self) -> &HistoryError {
        match self {
            HistoryError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Wrap with operation context.
    pub fn context(self, context: impl Into<String>) -> Self {
        HistoryError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(e: serde_json::Error) -> Self {
        HistoryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for HistoryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        HistoryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HistoryError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        HistoryError::Corruption(e.to_string())
    }
}

/// Attach operation context at a layer boundary.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;
