//! Error types for rowsync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in rowsync core operations.
///
/// Only run-scoped failures are errors. A row that cannot be applied is
/// reported as a [`FailedRow`](crate::FailedRow) and the batch continues.
#[derive(Debug, Error)]
pub enum CoreError {
    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] rowsync_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A DDL statement failed.
    #[error("provisioning failed on {object}: {message}")]
    Provisioning {
        /// The object the statement targeted.
        object: String,
        /// Description of the failure.
        message: String,
    },

    /// A batch manifest and its parts disagree.
    #[error("corrupt batch {batch}: {message}")]
    CorruptBatch {
        /// Batch directory or identifier.
        batch: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A replicated table does not exist in the store.
    #[error("table not found: {name}")]
    MissingTable {
        /// Name of the table.
        name: String,
    },

    /// A generated object required by the operation is not provisioned.
    #[error("{kind} not provisioned: {name}")]
    MissingObject {
        /// Kind of object (tracking table, trigger, procedure, scope table).
        kind: &'static str,
        /// Generated object name.
        name: String,
    },

    /// The setup violates a structural rule.
    #[error("invalid setup: {message}")]
    InvalidSetup {
        /// Description of the violation.
        message: String,
    },

    /// A filter parameter is missing or has the wrong type.
    #[error("invalid filter parameter {name}: {message}")]
    InvalidFilterParameter {
        /// Parameter name.
        name: String,
        /// Description of the problem.
        message: String,
    },

    /// A conflict hook requested an abort and the policy escalates it.
    #[error("conflict aborted on {table} key {key}")]
    ConflictAborted {
        /// Table of the aborted row.
        table: String,
        /// Display form of the primary key.
        key: String,
    },

    /// The operation was cancelled between batch parts.
    #[error("operation cancelled")]
    Cancelled,

    /// Another process holds the lock on a directory.
    #[error("directory locked: {path}")]
    Locked {
        /// The locked directory.
        path: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a provisioning error.
    pub fn provisioning(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Creates a corrupt batch error.
    pub fn corrupt_batch(batch: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptBatch {
            batch: batch.into(),
            message: message.into(),
        }
    }

    /// Creates a missing table error.
    pub fn missing_table(name: impl Into<String>) -> Self {
        Self::MissingTable { name: name.into() }
    }

    /// Creates a missing object error.
    pub fn missing_object(kind: &'static str, name: impl Into<String>) -> Self {
        Self::MissingObject {
            kind,
            name: name.into(),
        }
    }

    /// Creates an invalid setup error.
    pub fn invalid_setup(message: impl Into<String>) -> Self {
        Self::InvalidSetup {
            message: message.into(),
        }
    }

    /// Creates an invalid filter parameter error.
    pub fn invalid_parameter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFilterParameter {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::missing_object("tracking table", "Customer_tracking");
        assert_eq!(
            err.to_string(),
            "tracking table not provisioned: Customer_tracking"
        );

        let err = CoreError::corrupt_batch("b1", "part 2 missing");
        assert!(err.to_string().contains("part 2 missing"));
    }

    #[test]
    fn codec_error_converts() {
        let err: CoreError = rowsync_codec::CodecError::read("eof").into();
        assert!(matches!(err, CoreError::Codec(_)));
    }
}
