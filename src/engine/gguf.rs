//! In-process GGUF engine via llama-cpp-2.
//!
//! Generation runs on the blocking pool and hands pieces to the job through a
//! bounded channel, so a slow consumer throttles decoding and a dropped
//! consumer stops it.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{EngineError, EngineStream, FormatTag, StreamShape, TextEngine};
use crate::envelope::{GenerationParams, GenerationRequest};

/// Layer count meaning "offload everything".
const ALL_LAYERS: u32 = 999;

#[derive(Debug, Clone)]
pub struct GgufSettings {
    pub n_ctx: u32,
    pub n_gpu_layers: u32,
    /// 0 picks a thread count from the host.
    pub n_threads: u32,
}

impl GgufSettings {
    /// Offload all layers unless the GPU budget is zero.
    pub fn from_budget(max_model_len: u32, gpu_memory_utilization: f32) -> Self {
        Self {
            n_ctx: max_model_len,
            n_gpu_layers: if gpu_memory_utilization > 0.0 { ALL_LAYERS } else { 0 },
            n_threads: 0,
        }
    }
}

struct GgufModel {
    backend: LlamaBackend,
    model: LlamaModel,
    n_ctx: u32,
    n_threads: i32,
}

pub struct GgufEngine {
    inner: Arc<GgufModel>,
    format: Option<FormatTag>,
}

impl GgufEngine {
    /// Load a model from disk. Blocks; call from `spawn_blocking`.
    pub fn load(
        path: &Path,
        settings: &GgufSettings,
        format: Option<FormatTag>,
    ) -> Result<Self, EngineError> {
        let backend =
            LlamaBackend::init().map_err(|e| EngineError::Init(format!("backend init: {e}")))?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(settings.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &model_params)
            .map_err(|e| EngineError::Init(format!("load {}: {e}", path.display())))?;
        info!(
            model = %path.display(),
            n_ctx = settings.n_ctx,
            n_gpu_layers = settings.n_gpu_layers,
            format = format.map(|f| f.as_str()).unwrap_or("embedded"),
            "gguf model loaded"
        );
        Ok(Self {
            inner: Arc::new(GgufModel {
                backend,
                model,
                n_ctx: settings.n_ctx,
                n_threads: resolve_threads(settings.n_threads),
            }),
            format,
        })
    }

    fn render(&self, request: &GenerationRequest) -> Result<String, EngineError> {
        if let Some(format) = self.format {
            return Ok(format.render(&request.conversation));
        }
        let template = self
            .inner
            .model
            .chat_template(None)
            .map_err(|e| EngineError::Template(format!("model has no chat template: {e}")))?;
        let messages = request
            .conversation
            .iter()
            .map(|t| LlamaChatMessage::new(t.role.as_str().to_string(), t.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Template(e.to_string()))?;
        self.inner
            .model
            .apply_chat_template(&template, &messages, true)
            .map_err(|e| EngineError::Template(e.to_string()))
    }

    fn stop_sequences(&self, params: &GenerationParams) -> Vec<String> {
        let mut stops = params.stop.clone();
        if let Some(format) = self.format {
            for marker in format.stop_sequences() {
                if !stops.iter().any(|s| s == marker) {
                    stops.push((*marker).to_string());
                }
            }
        }
        stops
    }
}

#[async_trait]
impl TextEngine for GgufEngine {
    fn name(&self) -> &str {
        "gguf"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineStream, EngineError> {
        let prompt = self.render(request)?;
        let tokens = self.inner.tokenize(&prompt)?;
        if tokens.len() >= self.inner.n_ctx as usize {
            return Err(EngineError::Backend(format!(
                "prompt of {} tokens does not fit a {} token context",
                tokens.len(),
                self.inner.n_ctx
            )));
        }

        let params = request.parameters.clone();
        let stops = self.stop_sequences(&params);
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel::<Result<String, EngineError>>(1);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = inner.stream(&tokens, &params, stops, &tx, &cancel) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        let increments = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(EngineStream::new(StreamShape::Incremental, increments))
    }
}

impl GgufModel {
    fn tokenize(&self, text: &str) -> Result<Vec<LlamaToken>, EngineError> {
        self.model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Template(format!("tokenize: {e}")))
    }

    fn create_context(&self) -> Result<LlamaContext<'_>, EngineError> {
        let p = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_threads(self.n_threads)
            .with_n_threads_batch(self.n_threads);
        self.model
            .new_context(&self.backend, p)
            .map_err(|e| EngineError::Backend(format!("ctx: {e}")))
    }

    /// Decode until EOG, a stop sequence, `max_tokens`, cancellation, or the
    /// receiver going away.
    fn stream(
        &self,
        tokens: &[LlamaToken],
        params: &GenerationParams,
        stops: Vec<String>,
        tx: &mpsc::Sender<Result<String, EngineError>>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut ctx = self.create_context()?;
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        add_seq(&mut batch, tokens)?;
        decode(&mut ctx, &mut batch)?;

        let mut sampler = build_sampler(params);
        sampler.accept_many(tokens.iter().copied());
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut matcher = StopMatcher::new(stops);
        let mut pos = tokens.len() as i32;

        for _ in 0..params.max_tokens {
            if cancel.is_cancelled() {
                debug!("gguf generation cancelled");
                return Ok(());
            }
            if pos as u32 >= self.n_ctx {
                break;
            }
            let tok = sampler.sample(&ctx, -1);
            sampler.accept(tok);
            if self.model.is_eog_token(tok) {
                break;
            }
            let piece = self
                .model
                .token_to_piece(tok, &mut decoder, false, None)
                .map_err(|e| EngineError::Backend(format!("detok: {e}")))?;
            let (emit, stopped) = matcher.push(&piece);
            if !emit.is_empty() && tx.blocking_send(Ok(emit)).is_err() {
                return Ok(());
            }
            if stopped {
                return Ok(());
            }
            batch.clear();
            add_one(&mut batch, tok, pos)?;
            decode(&mut ctx, &mut batch)?;
            pos += 1;
        }
        let rest = matcher.flush();
        if !rest.is_empty() {
            let _ = tx.blocking_send(Ok(rest));
        }
        Ok(())
    }
}

fn add_seq(batch: &mut LlamaBatch, tokens: &[LlamaToken]) -> Result<(), EngineError> {
    let n = tokens.len();
    for (i, &tok) in tokens.iter().enumerate() {
        // Logits only for the last prompt token.
        batch
            .add(tok, i as i32, &[0], i + 1 == n)
            .map_err(|e| EngineError::Backend(format!("batch: {e}")))?;
    }
    Ok(())
}

fn add_one(batch: &mut LlamaBatch, tok: LlamaToken, pos: i32) -> Result<(), EngineError> {
    batch
        .add(tok, pos, &[0], true)
        .map_err(|e| EngineError::Backend(format!("batch: {e}")))
}

fn decode(ctx: &mut LlamaContext<'_>, batch: &mut LlamaBatch) -> Result<(), EngineError> {
    ctx.decode(batch)
        .map_err(|e| EngineError::Backend(format!("decode: {e}")))
}

fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    if params.temperature <= f32::EPSILON {
        return LlamaSampler::greedy();
    }
    LlamaSampler::chain_simple([
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(rand::random()),
    ])
}

fn resolve_threads(n: u32) -> i32 {
    if n == 0 {
        // Memory-bound; past 16 threads there is little gain.
        let optimal = num_cpus::get().clamp(1, 16);
        i32::try_from(optimal).unwrap_or(4)
    } else {
        i32::try_from(n).unwrap_or(4)
    }
}

/// Holds back text that might be the start of a stop sequence.
#[derive(Debug)]
pub(crate) struct StopMatcher {
    stops: Vec<String>,
    held: String,
}

impl StopMatcher {
    pub(crate) fn new(stops: Vec<String>) -> Self {
        let stops = stops.into_iter().filter(|s| !s.is_empty()).collect();
        Self {
            stops,
            held: String::new(),
        }
    }

    /// Returns the text safe to emit and whether a stop sequence was hit.
    pub(crate) fn push(&mut self, piece: &str) -> (String, bool) {
        self.held.push_str(piece);
        if let Some(idx) = self.stops.iter().filter_map(|s| self.held.find(s.as_str())).min() {
            let emit = self.held[..idx].to_string();
            self.held.clear();
            return (emit, true);
        }
        let keep = self
            .stops
            .iter()
            .map(|s| partial_suffix(&self.held, s))
            .max()
            .unwrap_or(0);
        let split = self.held.len() - keep;
        let emit = self.held[..split].to_string();
        self.held.replace_range(..split, "");
        (emit, false)
    }

    pub(crate) fn flush(&mut self) -> String {
        std::mem::take(&mut self.held)
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `stop`.
fn partial_suffix(text: &str, stop: &str) -> usize {
    (1..stop.len())
        .rev()
        .filter(|&k| stop.is_char_boundary(k))
        .find(|&k| text.ends_with(&stop[..k]))
        .unwrap_or(0)
}
