//! Engine error types.
//!
//! `StoreError` is what an `ObjectStore` reports; `ReconcileError` is what a
//! reconcile run reports to the worker pool, which uses `ErrorClass` to decide
//! how to log and requeue it.

use crate::apply::ApplyConflict;
use thiserror::Error;

/// Errors reported by an object store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure (stale resource version)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Field-ownership conflict raised by apply
    #[error(transparent)]
    FieldConflict(#[from] ApplyConflict),

    /// The object was rejected by store-side validation
    #[error("Invalid object: {0}")]
    Invalid(String),

    /// Transport or I/O failure talking to the store
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by the dynamic document accessors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    /// A value exists at the path but has the wrong type
    #[error("Type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Path that was accessed
        path: String,
        /// Type the caller asked for
        expected: &'static str,
        /// Type actually stored
        found: &'static str,
    },

    /// The path is empty, malformed, or points outside an array
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath {
        /// Path that was accessed
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// A required value is missing
    #[error("Missing value at '{0}'")]
    Missing(String),

    /// The document root is not a JSON object
    #[error("Document root must be an object, found {0}")]
    NotAnObject(&'static str),
}

/// Errors raised by the type registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The group/version/kind was never registered
    #[error("Kind not registered: {0}")]
    UnknownKind(String),

    /// The object carries no apiVersion/kind
    #[error("Object has no apiVersion/kind")]
    MissingTypeMeta,

    /// The object's kind differs from the requested type
    #[error("Kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Kind of the requested type
        expected: String,
        /// Kind carried by the object
        found: String,
    },

    /// Decoding or encoding failed
    #[error("Codec error for {kind}: {source}")]
    Codec {
        /// Kind being decoded or encoded
        kind: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that abort a single reconcile run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Object store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Dynamic document access failed
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    /// Typed decode/encode failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// JSON serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// More than one owned resource of a managed kind matched the Declaration
    #[error("{count} {kind} objects owned by {declaration}, expected at most 1")]
    AmbiguousOwnership {
        /// Declaration key (namespace/name)
        declaration: String,
        /// Owned kind that matched more than once
        kind: String,
        /// Number of matches
        count: usize,
    },

    /// The renderer could not produce the desired objects
    #[error("Render failed: {0}")]
    Render(String),

    /// The engine is shutting down
    #[error("Reconcile cancelled")]
    Cancelled,
}

/// Retry classification of a failed reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Optimistic-concurrency or field-ownership conflict
    Conflict,
    /// The Declaration's spec cannot be rendered or was rejected by the store
    Invalid,
    /// More than one owned resource matched
    Ambiguous,
    /// I/O, transport, or anything else worth retrying
    Transient,
}

impl ReconcileError {
    /// Classifies the error for logging and retry.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(StoreError::Conflict(_) | StoreError::FieldConflict(_)) => {
                ErrorClass::Conflict
            }
            Self::Store(StoreError::Invalid(_))
            | Self::Document(_)
            | Self::Registry(_)
            | Self::Serialization(_)
            | Self::Render(_) => ErrorClass::Invalid,
            Self::AmbiguousOwnership { .. } => ErrorClass::Ambiguous,
            Self::Store(StoreError::NotFound(_) | StoreError::Transport(_)) | Self::Cancelled => {
                ErrorClass::Transient
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            ReconcileError::from(StoreError::Conflict("stale".into())).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            ReconcileError::from(StoreError::Invalid("bad".into())).class(),
            ErrorClass::Invalid
        );
        assert_eq!(
            ReconcileError::from(StoreError::Transport("reset".into())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ReconcileError::Render("missing image".into()).class(),
            ErrorClass::Invalid
        );
        let ambiguous = ReconcileError::AmbiguousOwnership {
            declaration: "default/nginx".into(),
            kind: "Deployment".into(),
            count: 2,
        };
        assert_eq!(ambiguous.class(), ErrorClass::Ambiguous);
        assert_eq!(
            ambiguous.to_string(),
            "2 Deployment objects owned by default/nginx, expected at most 1"
        );
    }
}
