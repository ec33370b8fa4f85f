//! Error types for extscript.

use thiserror::Error;

use crate::types::ReturnType;

/// Common error type for script compilation and execution.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// Script source could not be obtained or compiled.
    #[error("compile error in script '{name}': {message}")]
    Compile { name: String, message: String },

    /// Failure while running a compiled script.
    ///
    /// Covers runtime errors raised by the script itself as well as
    /// faults in the bindings it called.
    #[error("evaluation error in script '{name}': {message}")]
    Evaluation { name: String, message: String },

    /// The script result does not match the expected return type.
    #[error("conversion error: expected {expected}, {message}")]
    Conversion {
        expected: ReturnType,
        message: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The worker pool for a path no longer accepts work.
    #[error("worker pool for '{0}' is shut down")]
    PoolShutdown(String),

    /// Outbound HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ScriptError {
    fn from(e: reqwest::Error) -> Self {
        ScriptError::Http(e.to_string())
    }
}

/// Result type alias for extscript operations.
pub type Result<T> = std::result::Result<T, ScriptError>;
