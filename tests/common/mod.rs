//! Shared test engine.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use sealed_llm::engine::{EngineError, EngineHandle, EngineStream, StreamShape, TextEngine};
use sealed_llm::envelope::GenerationRequest;
use sealed_llm::security::{Codec, EncryptedBlob, Key};
use sealed_llm::worker::Worker;

#[derive(Clone)]
pub enum Script {
    /// Yield these increments, then end.
    Items(Vec<Result<String, EngineError>>),
    /// Refuse to start.
    FailStart(EngineError),
    /// Yield these increments, then never finish.
    Hang(Vec<String>),
    /// Never return from `generate`.
    Stall,
    /// Wait this long before each increment.
    Paced(Duration, Vec<String>),
}

pub struct ScriptedEngine {
    shape: StreamShape,
    script: Script,
    requests: Mutex<Vec<GenerationRequest>>,
    pulled: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(shape: StreamShape, script: Script) -> Arc<Self> {
        Arc::new(Self {
            shape,
            script,
            requests: Mutex::new(Vec::new()),
            pulled: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn incremental(items: &[&str]) -> Arc<Self> {
        Self::new(
            StreamShape::Incremental,
            Script::Items(items.iter().map(|s| Ok(s.to_string())).collect()),
        )
    }

    pub fn cumulative(items: &[&str]) -> Arc<Self> {
        Self::new(
            StreamShape::Cumulative,
            Script::Items(items.iter().map(|s| Ok(s.to_string())).collect()),
        )
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Increments taken from the engine's streams so far.
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<EngineStream, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        let pulled = Arc::clone(&self.pulled);
        let count = move |_: &Result<String, EngineError>| {
            pulled.fetch_add(1, Ordering::SeqCst);
        };
        match &self.script {
            Script::FailStart(e) => Err(e.clone()),
            Script::Stall => futures::future::pending().await,
            Script::Items(items) => Ok(EngineStream::new(
                self.shape,
                futures::stream::iter(items.clone()).inspect(count).boxed(),
            )),
            Script::Paced(pace, items) => {
                let pace = *pace;
                let paced = futures::stream::iter(items.clone()).then(move |item| async move {
                    tokio::time::sleep(pace).await;
                    Ok::<_, EngineError>(item)
                });
                Ok(EngineStream::new(self.shape, paced.inspect(count).boxed()))
            }
            Script::Hang(items) => {
                let head = futures::stream::iter(items.clone().into_iter().map(Ok));
                Ok(EngineStream::new(
                    self.shape,
                    head.chain(futures::stream::pending()).boxed(),
                ))
            }
        }
    }
}

/// A worker over `engine` and a client codec sharing its key.
pub fn worker_for(engine: Arc<ScriptedEngine>) -> (Worker, Codec) {
    let key = Key::generate();
    let handle = Arc::new(EngineHandle::ready(engine));
    (Worker::new(Some(Codec::new(&key)), handle), Codec::new(&key))
}

pub fn seal(codec: &Codec, body: &str) -> EncryptedBlob {
    codec.encrypt(body.as_bytes()).unwrap()
}
