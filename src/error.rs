//! Error types for drvstream.

use thiserror::Error;

/// Main error type for drvstream.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum DrvStreamError {
    #[error("usage error: {0}")]
    Usage(String),

    /// The evaluator failed while walking a path or forcing a value.
    /// Reported per path; does not abort the run.
    #[error("evaluation error: {0}")]
    Eval(String),

    /// Structural mismatch at a path: unsupported value kind, unknown
    /// system, malformed accessor. Same treatment as [`Self::Eval`].
    #[error("type error: {0}")]
    Type(String),

    /// Malformed frame, unexpected ordering, or worker EOF mid-response.
    /// Fatal: winds down every collector.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker reported a fatal failure (store open, top-level eval).
    #[error("worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DrvStreamError {
    /// Errors that are confined to a single path. The worker turns these
    /// into an error frame and keeps serving jobs; everything else tears
    /// the worker down.
    pub fn is_per_path(&self) -> bool {
        matches!(self, Self::Eval(_) | Self::Type(_))
    }
}

/// Result type alias for drvstream operations.
pub type Result<T> = std::result::Result<T, DrvStreamError>;
