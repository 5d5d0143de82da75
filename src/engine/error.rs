//! Engine error types.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("engine initialization failed: {0}")]
    Init(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("prompt formatting failed: {0}")]
    Template(String),

    #[error("generation failed: {0}")]
    Backend(String),

    #[error("malformed engine stream: {0}")]
    Protocol(String),

    #[error("engine rewrote already emitted text")]
    NonMonotonic,
}
