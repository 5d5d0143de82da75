//! Engine backed by a local `llama-server` process.
//!
//! With a known prompt format the conversation is rendered here and sent to
//! `/completion`; otherwise `/v1/chat/completions` lets the server apply the
//! model's own chat template. Both endpoints stream per-token fragments.

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sse::SseDecoder;
use super::{EngineError, EngineStream, FormatTag, IncrementStream, StreamShape, TextEngine};
use crate::envelope::GenerationRequest;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LlamaServerConfig {
    /// Base URL, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Rendered prompt format; `None` defers to the server's chat template.
    pub format: Option<FormatTag>,
    /// How long to wait for `/health` to report ready.
    pub ready_timeout: Duration,
    /// Name passed as `model` on chat requests.
    pub model_alias: String,
}

impl Default for LlamaServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            format: None,
            ready_timeout: Duration::from_secs(30),
            model_alias: "local".to_string(),
        }
    }
}

pub struct LlamaServerEngine {
    client: reqwest::Client,
    config: LlamaServerConfig,
}

impl LlamaServerEngine {
    pub fn new(config: LlamaServerConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Init(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Build the engine and wait until the server reports healthy.
    pub async fn connect(config: LlamaServerConfig) -> Result<Self, EngineError> {
        let engine = Self::new(config)?;
        engine.wait_ready().await?;
        Ok(engine)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        let url = self.url("/health");
        loop {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(url = %self.config.base_url, "llama-server ready");
                    return Ok(());
                }
                Ok(resp) => debug!(status = %resp.status(), "llama-server still loading"),
                Err(e) => debug!(error = %e, "llama-server not reachable yet"),
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Unavailable(format!(
                    "llama-server at {} not ready after {}s",
                    self.config.base_url,
                    self.config.ready_timeout.as_secs()
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn completion_body(&self, format: FormatTag, request: &GenerationRequest) -> CompletionBody {
        let params = &request.parameters;
        let mut stop = params.stop.clone();
        for marker in format.stop_sequences() {
            if !stop.iter().any(|s| s == marker) {
                stop.push((*marker).to_string());
            }
        }
        CompletionBody {
            prompt: format.render(&request.conversation),
            n_predict: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop,
            stream: true,
            cache_prompt: true,
        }
    }

    fn chat_body<'a>(&'a self, request: &'a GenerationRequest) -> ChatBody<'a> {
        let params = &request.parameters;
        ChatBody {
            model: &self.config.model_alias,
            messages: request
                .conversation
                .iter()
                .map(|t| ChatMessage {
                    role: t.role.as_str(),
                    content: &t.content,
                })
                .collect(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: &params.stop,
            stream: true,
        }
    }
}

#[async_trait]
impl TextEngine for LlamaServerEngine {
    fn name(&self) -> &str {
        "llama-server"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<EngineStream, EngineError> {
        let (builder, api) = match self.config.format {
            Some(format) => (
                self.client
                    .post(self.url("/completion"))
                    .json(&self.completion_body(format, request)),
                Api::Completion,
            ),
            None => (
                self.client
                    .post(self.url("/v1/chat/completions"))
                    .json(&self.chat_body(request)),
                Api::Chat,
            ),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            // The body can quote the prompt, so only the status is reported.
            warn!(status = %status, "llama-server rejected generation request");
            return Err(match status.as_u16() {
                400 => EngineError::Template(format!("llama-server returned {status}")),
                _ => EngineError::Backend(format!("llama-server returned {status}")),
            });
        }
        Ok(EngineStream::new(
            StreamShape::Incremental,
            sse_increments(response.bytes_stream(), api),
        ))
    }
}

#[derive(Serialize)]
struct CompletionBody {
    prompt: String,
    n_predict: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    stream: bool,
    cache_prompt: bool,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionEvent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

#[derive(Deserialize)]
struct ChatEvent {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: Option<ChatDelta>,
}

#[derive(Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Api {
    Completion,
    Chat,
}

#[derive(Debug, PartialEq, Eq)]
enum Decoded {
    Text(String),
    Last(String),
    Skip,
    Done,
}

impl Api {
    fn decode(&self, data: &str) -> Result<Decoded, EngineError> {
        if data.trim() == "[DONE]" {
            return Ok(Decoded::Done);
        }
        let value: Value = serde_json::from_str(data)
            .map_err(|e| EngineError::Protocol(format!("event is not JSON: {e}")))?;
        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("llama-server reported an error");
            return Err(EngineError::Backend(message.to_string()));
        }
        match self {
            Api::Completion => {
                let event: CompletionEvent = serde_json::from_value(value)
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
                Ok(if event.stop {
                    Decoded::Last(event.content)
                } else {
                    Decoded::Text(event.content)
                })
            }
            Api::Chat => {
                let event: ChatEvent = serde_json::from_value(value)
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
                let text = event
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content.filter(|c| !c.is_empty()).or(d.reasoning_content));
                Ok(match text {
                    Some(text) => Decoded::Text(text),
                    None => Decoded::Skip,
                })
            }
        }
    }
}

struct SseState<B, E> {
    body: BoxStream<'static, Result<B, E>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    api: Api,
    body_done: bool,
    finished: bool,
}

/// Turn an SSE byte stream into engine increments.
fn sse_increments<S, B, E>(body: S, api: Api) -> IncrementStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        body: body.boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        api,
        body_done: false,
        finished: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        let item = next_increment(&mut state).await?;
        Some((item, state))
    })
    .boxed()
}

async fn next_increment<B, E>(state: &mut SseState<B, E>) -> Option<Result<String, EngineError>>
where
    B: AsRef<[u8]>,
    E: Display,
{
    loop {
        if state.finished {
            return None;
        }
        if let Some(data) = state.pending.pop_front() {
            match state.api.decode(&data) {
                Ok(Decoded::Text(text)) => return Some(Ok(text)),
                Ok(Decoded::Skip) => continue,
                Ok(Decoded::Last(text)) => {
                    state.finished = true;
                    return Some(Ok(text));
                }
                Ok(Decoded::Done) => {
                    state.finished = true;
                    return None;
                }
                Err(e) => {
                    state.finished = true;
                    return Some(Err(e));
                }
            }
        }
        if state.body_done {
            return None;
        }
        match state.body.next().await {
            Some(Ok(bytes)) => {
                let events = state.decoder.push(bytes.as_ref());
                state.pending.extend(events);
            }
            Some(Err(e)) => {
                state.finished = true;
                return Some(Err(EngineError::Unavailable(format!(
                    "stream interrupted: {e}"
                ))));
            }
            None => {
                state.body_done = true;
                let events = state.decoder.finish();
                state.pending.extend(events);
            }
        }
    }
}
