//! Client side: encrypt requests, submit them, render the streamed reply.

mod endpoint;
mod local;
mod session;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::security::{EncryptedBlob, EncryptionError};
use crate::worker::OutputChunk;

pub use endpoint::{EndpointConfig, EndpointTransport, PollStatus};
pub use local::LocalTransport;
pub use session::{
    is_exit_command, Session, SessionConfig, SessionEnd, SessionHistory, TurnOutcome,
    DEFAULT_SYSTEM_PROMPT, EXIT_COMMANDS,
};

/// Reply chunks in emission order; the stream ends when the job ends.
pub type ReplyStream = BoxStream<'static, Result<OutputChunk, TransportError>>;

/// Carries one encrypted request to a worker and its reply back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, blob: EncryptedBlob) -> Result<ReplyStream, TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("job ended with status {0}")]
    JobFailed(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => TransportError::Status {
                status: status.as_u16(),
            },
            None if e.is_decode() => TransportError::Protocol(e.to_string()),
            None => TransportError::Http(e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not encrypt request: {0}")]
    Encrypt(#[from] EncryptionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
