//! Engine boundary for sealed-llm.
//!
//! The generation engine is an opaque producer of text increments. Engines
//! declare whether their increments are cumulative snapshots or per-token
//! fragments; the [`DeltaStreamer`] turns either shape into emit-once deltas.

pub mod delta;
pub mod error;
pub mod format;
#[cfg(feature = "gguf")]
pub mod gguf;
pub mod handle;
pub mod llama_server;
mod sse;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::envelope::GenerationRequest;

pub use delta::{next_delta, DeltaStreamer, StreamShape};
pub use error::EngineError;
pub use format::{identifier_to_format_hint, FormatTag};
pub use handle::EngineHandle;
pub use llama_server::{LlamaServerConfig, LlamaServerEngine};

/// Lazy, finite, non-restartable sequence of engine increments.
pub type IncrementStream = BoxStream<'static, Result<String, EngineError>>;

/// What an engine hands back for one generation.
pub struct EngineStream {
    pub shape: StreamShape,
    pub increments: IncrementStream,
}

impl EngineStream {
    pub fn new(shape: StreamShape, increments: IncrementStream) -> Self {
        Self { shape, increments }
    }
}

impl std::fmt::Debug for EngineStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStream")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// A text-generation engine shared by every in-flight job.
///
/// `generate` fails before any increment is produced when the request cannot
/// be turned into a prompt (template errors, unreachable backend). After it
/// returns, failures surface as `Err` items on the stream. Engines stop work
/// when `cancel` fires or when the stream is dropped.
#[async_trait]
pub trait TextEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineStream, EngineError>;
}
