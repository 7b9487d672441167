// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the hub core.
//!
//! Errors are categorized by their source (coordination store, external
//! collaborators, configuration) and carry enough context to debug a failure
//! without a stack trace.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Coordination(VersionConflict)` | Yes | Lost an optimistic write race |
//! | `Coordination(Unavailable)` | Yes | Store unreachable |
//! | `Coordination(NoNode)` | No | Node missing (usually tolerated by callers) |
//! | `Service` | Yes | Channel service, content store or remote feed failed |
//! | `Config` | No | Configuration invalid |
//! | `QueryFailed` | No | Fan-out query did not complete on every target |
//! | `InvalidState` | No | State machine violation |
//! | `Shutdown` | No | Shutting down |
//! | `Internal` | No | Unexpected internal error |

use thiserror::Error;

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors reported by a [`CoordinationStore`](crate::coordination::CoordinationStore).
///
/// Version conflicts are reported distinctly from every other failure so
/// optimistic writers can tell "retry" from "give up".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Conditional write rejected: the node was modified since it was read.
    #[error("version conflict at {path}: expected {expected}, found {actual:?}")]
    VersionConflict {
        path: String,
        expected: u32,
        actual: Option<u32>,
    },

    /// The node (or its parent) does not exist.
    #[error("no node at {path}")]
    NoNode { path: String },

    /// The path is not an absolute, slash-separated node path.
    #[error("invalid path {path:?}")]
    InvalidPath { path: String },

    /// The store could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Check if this is an optimistic-concurrency conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Check if the node was missing.
    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode { .. })
    }
}

/// Simplified error from an external collaborator
/// (channel service, content store, remote feed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError(pub String);

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ServiceError {}

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Errors that can occur in the hub core.
#[derive(Error, Debug)]
pub enum HubError {
    /// Coordination store failure.
    #[error("Coordination error: {0}")]
    Coordination(#[from] StoreError),

    /// External collaborator failure.
    ///
    /// Occurs when the channel service, content store or a remote peer
    /// rejects or fails an operation. Retryable.
    #[error("Service error ({operation}): {message}")]
    Service { operation: String, message: String },

    /// Invalid or missing configuration.
    ///
    /// Includes invalid stored channel state such as a global master that is
    /// also listed as one of its own satellites.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fan-out query did not succeed on every target before the deadline.
    ///
    /// Never carries partial results.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Create a service error for the named operation.
    pub fn service(operation: impl Into<String>, source: ServiceError) -> Self {
        Self::Service {
            operation: operation.into(),
            message: source.0,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Coordination(StoreError::VersionConflict { .. }) => true,
            Self::Coordination(StoreError::Unavailable(_)) => true,
            Self::Coordination(StoreError::NoNode { .. }) => false,
            Self::Coordination(StoreError::InvalidPath { .. }) => false,
            Self::Service { .. } => true,
            Self::Config(_) => false,
            Self::QueryFailed(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
