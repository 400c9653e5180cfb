//! Error types for Auralis

use thiserror::Error;

/// Core error type
///
/// Control-thread API calls surface these to the caller. Audio-thread paths
/// never return errors; they log and degrade instead.
#[derive(Error, Debug)]
pub enum AurError {
    /// Pre-condition violation at an API boundary; carries the offending
    /// parameter or struct key path
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Resource I/O target missing
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Operation not valid in the current state
    #[error("Invalid operation: {0}")]
    Modal(String),

    /// Feature is specified but not available in this build
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Unspecified(String),
}

/// Result type alias
pub type AurResult<T> = Result<T, AurError>;
