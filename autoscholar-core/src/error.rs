//! Error types for the Autoscholar agent loop.
//!
//! This module provides a unified error type for all operations in the
//! autoscholar-core library, covering persistence, review workflow state,
//! collaborator failures, self-modification and configuration.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for autoscholar-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to read or write a persisted store file.
    #[error("storage error on '{path}': {source}")]
    Storage {
        /// The path that could not be read or written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted store file contained invalid JSON, or a record could not
    /// be serialized.
    #[error("failed to (de)serialize '{path}': {source}")]
    Serialization {
        /// The path containing invalid JSON.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The requested item does not exist, or is not in the state the
    /// operation requires.
    #[error("{kind} not found: '{id}'")]
    NotFound {
        /// What kind of item was looked up (e.g. "feedback item").
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// The operation is not valid for the current state or input.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the violated precondition.
        message: String,
    },

    /// The produce collaborator failed for a task.
    #[error("production failed: {message}")]
    Production {
        /// Description of what went wrong.
        message: String,
    },

    /// The verify collaborator failed.
    #[error("verification failed: {message}")]
    Verification {
        /// Description of what went wrong.
        message: String,
    },

    /// The change proposer failed to produce a change list.
    #[error("change proposal failed: {message}")]
    Proposal {
        /// Description of what went wrong.
        message: String,
    },

    /// A change targeted a file that does not exist.
    #[error("file not found: '{path}'")]
    FileNotFound {
        /// The missing file.
        path: PathBuf,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error that doesn't fit other categories.
    #[error("{message}")]
    Other {
        /// Description of the error.
        message: String,
    },
}

/// Coarse result codes reported to external drivers such as the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unknown id, or item not in the expected state.
    NotFound,
    /// The operation is invalid for the current state.
    InvalidState,
    /// Persistence failure.
    StorageError,
    /// Anything else.
    Other,
}

impl ErrorCode {
    /// Process exit code for this result code.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Other => 1,
            ErrorCode::NotFound => 2,
            ErrorCode::InvalidState => 3,
            ErrorCode::StorageError => 4,
        }
    }

    /// Stable snake_case name of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::StorageError => "storage_error",
            ErrorCode::Other => "error",
        }
    }
}

impl Error {
    /// Create a new `NotFound` error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a new `InvalidState` error with the given message.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a new `Production` error with the given message.
    pub fn production(message: impl Into<String>) -> Self {
        Self::Production {
            message: message.into(),
        }
    }

    /// Create a new `Verification` error with the given message.
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }

    /// Create a new `Proposal` error with the given message.
    pub fn proposal(message: impl Into<String>) -> Self {
        Self::Proposal {
            message: message.into(),
        }
    }

    /// Create a new `Config` error with the given message.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new `Other` error with the given message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Map this error onto the externally reported result code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Storage { .. } | Error::Serialization { .. } => ErrorCode::StorageError,
            Error::NotFound { .. } | Error::FileNotFound { .. } => ErrorCode::NotFound,
            Error::InvalidState { .. } => ErrorCode::InvalidState,
            _ => ErrorCode::Other,
        }
    }
}

/// A specialized `Result` type for autoscholar-core operations.
pub type Result<T> = std::result::Result<T, Error>;
