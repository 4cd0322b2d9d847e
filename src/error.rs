//! Error types for lattice
//!
//! Exit codes:
//! - 0: Success
//! - 1: User/domain error (validation, not-found, conflict, policy-blocked)
//! - 2: System error (lock timeout, I/O, corrupt data)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the lattice CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const DOMAIN_ERROR: i32 = 1;
    pub const SYSTEM_ERROR: i32 = 2;
}

/// Main error type for lattice operations
#[derive(Error, Debug)]
pub enum Error {
    // Domain errors (exit code 1)
    #[error("No .lattice directory found from {0}")]
    NotInitialized(PathBuf),

    #[error("Invalid id '{id}': expected {expected}")]
    InvalidId { id: String, expected: String },

    #[error("Invalid actor '{0}': expected agent:<id>, human:<id>, or team:<id>")]
    InvalidActor(String),

    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Id already exists with a different payload: {0}")]
    IdempotencyConflict(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    CompletionBlocked(String),

    #[error("Review rework limit reached ({count} of {limit}). Override with --force --reason.")]
    ReviewCycleExceeded { count: usize, limit: usize },

    // System errors (exit code 2)
    #[error("Could not acquire lock '{0}' before timeout")]
    LockTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotInitialized(_) => "NOT_INITIALIZED",
            Error::InvalidId { .. } => "INVALID_ID",
            Error::InvalidActor(_) => "INVALID_ACTOR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::CompletionBlocked(_) => "COMPLETION_BLOCKED",
            Error::ReviewCycleExceeded { .. } => "REVIEW_CYCLE_EXCEEDED",
            Error::LockTimeout(_) => "LOCK_TIMEOUT",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "CORRUPT",
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotInitialized(_)
            | Error::InvalidId { .. }
            | Error::InvalidActor(_)
            | Error::Validation(_)
            | Error::NotFound(_)
            | Error::IdempotencyConflict(_)
            | Error::InvalidTransition { .. }
            | Error::CompletionBlocked(_)
            | Error::ReviewCycleExceeded { .. } => exit_codes::DOMAIN_ERROR,

            Error::LockTimeout(_) | Error::Io(_) | Error::Json(_) => exit_codes::SYSTEM_ERROR,
        }
    }
}

/// Result type alias for lattice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in the structured JSON envelope
#[derive(serde::Serialize)]
pub struct JsonError {
    pub ok: bool,
    pub error: JsonErrorBody,
}

#[derive(serde::Serialize)]
pub struct JsonErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            ok: false,
            error: JsonErrorBody {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }
}
