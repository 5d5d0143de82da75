//! Job worker.
//!
//! Turns one job into a stream of text deltas, ending in either a clean
//! finish or one in-band error item. Many jobs may run at once against the
//! same engine.

mod job;
mod state;
mod stream;

use std::sync::Arc;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineHandle;
use crate::security::Codec;

pub use job::{Job, JobInput};
pub use state::{JobRun, JobState, ZERO_OUTPUT_DIAGNOSTIC};
pub use stream::{ErrorKind, OutputChunk, StreamItem};

/// Decrypts jobs and streams engine output for them.
///
/// Without a codec every job fails with [`ErrorKind::SecurityError`].
#[derive(Clone)]
pub struct Worker {
    codec: Option<Codec>,
    engine: Arc<EngineHandle>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(codec: Option<Codec>, engine: Arc<EngineHandle>) -> Self {
        Self {
            codec,
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    pub fn has_key(&self) -> bool {
        self.codec.is_some()
    }

    /// Token that cancels every job started by this worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start a job without driving it.
    pub fn start(&self, job: Job) -> JobRun {
        JobRun::new(
            job,
            self.codec.clone(),
            Arc::clone(&self.engine),
            self.shutdown.child_token(),
        )
    }

    /// Handle a job, yielding its items as they become available.
    pub fn handle(&self, job: Job) -> impl Stream<Item = StreamItem> + Send + 'static {
        self.start(job).into_stream()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("has_key", &self.has_key())
            .field("engine", &self.engine)
            .finish()
    }
}
