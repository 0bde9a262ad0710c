//! Error types for the object store collaborator and the navigation layer.

use std::{fmt, io};
use thiserror::Error;

/// Errors reported by an [`ObjectStoreClient`](crate::store::ObjectStoreClient).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("permission denied on {0}")]
    PermissionDenied(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StoreError::PermissionDenied(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Logical operation names reported to telemetry and carried in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetItem,
    ItemExists,
    IsContainer,
    GetChildItems,
    NewItem,
    CopyItem,
    RemoveItem,
    GetContentReader,
    GetContentWriter,
    ClearContent,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GetItem => "GetItem",
            Operation::ItemExists => "ItemExists",
            Operation::IsContainer => "IsContainer",
            Operation::GetChildItems => "GetChildItems",
            Operation::NewItem => "NewItem",
            Operation::CopyItem => "CopyItem",
            Operation::RemoveItem => "RemoveItem",
            Operation::GetContentReader => "GetContentReader",
            Operation::GetContentWriter => "GetContentWriter",
            Operation::ClearContent => "ClearContent",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the navigation engine.
///
/// `NotFound` is an expected outcome for existence probes and is converted to
/// `false` there; every other variant terminates the operation.
#[derive(Debug, Error)]
pub enum NavError {
    #[error("`{path}` not found")]
    NotFound { path: String },

    #[error("{operation} on `{path}` denied: {message}")]
    PermissionDenied {
        operation: Operation,
        path: String,
        message: String,
    },

    #[error("`{path}` is a container with children; use a recursive removal")]
    NotEmpty { path: String },

    #[error("`{child}` is not beneath `{parent}`")]
    InvalidRelation { parent: String, child: String },

    #[error("transfer of `{path}` failed: {source}")]
    TransferFailed {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("{operation} on `{path}` was cancelled")]
    Cancelled { operation: Operation, path: String },

    #[error("`{path}` already exists")]
    AlreadyExists { path: String },

    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A recursive copy or removal failed on one child. Children that
    /// completed before the failure are not rolled back; no new child is
    /// started after it, and `skipped` counts those never attempted.
    #[error(
        "{operation} on `{path}` failed after {completed} children completed, \
         {skipped} not attempted: {source}"
    )]
    Recursive {
        operation: Operation,
        path: String,
        completed: usize,
        skipped: usize,
        #[source]
        source: Box<NavError>,
    },

    #[error("{operation} on `{path}` failed: {source}")]
    Store {
        operation: Operation,
        path: String,
        #[source]
        source: StoreError,
    },
}

impl NavError {
    /// Wrap a store error with operation context, lifting the variants that
    /// have a first-class navigation meaning.
    pub fn from_store(operation: Operation, path: impl Into<String>, err: StoreError) -> Self {
        let path = path.into();
        match err {
            StoreError::NotFound(_) => NavError::NotFound { path },
            StoreError::PermissionDenied(message) => NavError::PermissionDenied {
                operation,
                path,
                message,
            },
            StoreError::AlreadyExists(_) => NavError::AlreadyExists { path },
            source => NavError::Store {
                operation,
                path,
                source,
            },
        }
    }

    pub fn cancelled(operation: Operation, path: impl Into<String>) -> Self {
        NavError::Cancelled {
            operation,
            path: path.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NavError::NotFound { .. })
    }
}

pub type NavResult<T> = Result<T, NavError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_lift_store_not_found() {
        let err = NavError::from_store(
            Operation::GetItem,
            "b/x",
            StoreError::NotFound("object b/x".into()),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_should_keep_context_for_backend_errors() {
        let err = NavError::from_store(
            Operation::CopyItem,
            "b/x",
            StoreError::Backend("boom".into()),
        );
        let message = err.to_string();
        assert!(message.contains("CopyItem"));
        assert!(message.contains("b/x"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_should_report_completed_children_in_recursive_error() {
        let err = NavError::Recursive {
            operation: Operation::RemoveItem,
            path: "b/dir/c.txt".into(),
            completed: 2,
            skipped: 3,
            source: Box::new(NavError::NotFound {
                path: "b/dir/c.txt".into(),
            }),
        };
        let message = err.to_string();
        assert!(message.contains("after 2 children completed"));
        assert!(message.contains("3 not attempted"));
    }
}
