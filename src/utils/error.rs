//! Error types for castmedia
//!
//! This module defines the status type shared by the coordinator, the
//! sub-pipelines and the configuration layer. We use thiserror for the
//! error definitions; the demo binary uses anyhow on top of it.

use thiserror::Error;

/// Main error type for castmedia
///
/// There is deliberately no "OK" variant: anything that carries a
/// `PipelineError` is a failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Generic pipeline abort, used for every backend failure
    #[error("Pipeline abort")]
    Abort,

    /// A decoder rejected a stream configuration
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Software fallback decoding failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation exists in the API but has no implementation
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// API called in a state that violates its preconditions
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),
}

impl PipelineError {
    /// Create an invalid-state error from string
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        PipelineError::InvalidState(msg.into())
    }

    /// Whether the error leaves the pipeline unusable until Stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Abort | PipelineError::Decode(_))
    }
}

/// Convenience type alias for Results in castmedia
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for converting other errors to PipelineError
pub trait IntoPipelineError<T> {
    /// Convert this error into a configuration error with the given context
    fn config_err(self, context: &str) -> Result<T>;
    /// Convert this error into an initialization failure with the given context
    fn init_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoPipelineError<T> for std::result::Result<T, E> {
    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PipelineError::Config(format!("{}: {}", context, e)))
    }

    fn init_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PipelineError::InitializationFailed(format!("{}: {}", context, e)))
    }
}
