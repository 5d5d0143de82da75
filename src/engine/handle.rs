//! Process-wide engine handle.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;

use super::{EngineError, TextEngine};

/// Holds the one engine instance shared by every job.
///
/// The first caller of [`EngineHandle::ensure_initialized`] runs the factory;
/// concurrent callers wait for it and then share the result.
#[derive(Default)]
pub struct EngineHandle {
    engine: OnceCell<Arc<dyn TextEngine>>,
}

impl EngineHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that is already initialized with `engine`.
    pub fn ready(engine: Arc<dyn TextEngine>) -> Self {
        Self {
            engine: OnceCell::new_with(Some(engine)),
        }
    }

    pub async fn ensure_initialized<F, Fut>(&self, init: F) -> Result<Arc<dyn TextEngine>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn TextEngine>, EngineError>>,
    {
        self.engine.get_or_try_init(init).await.map(Arc::clone)
    }

    pub fn get(&self) -> Option<Arc<dyn TextEngine>> {
        self.engine.get().cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.initialized()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.get().map(|e| e.name().to_string()))
            .finish()
    }
}
