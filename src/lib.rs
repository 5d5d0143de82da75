//! sealed-llm
//!
//! Encrypted request / streamed response layer in front of a text-generation
//! engine. Clients seal a chat request with a pre-shared key; the worker opens
//! it in memory, drives the engine and streams the reply back as text
//! deltas. The hosting provider only ever sees ciphertext going in.
//!
//! # Layout
//!
//! - [`security`]: AES-256-GCM payload codec
//! - [`envelope`]: request payload parsing and normalization
//! - [`engine`]: engine trait, delta computation, llama.cpp engines
//! - [`worker`]: per-job state machine
//! - [`host`]: newline-delimited job runner around the worker
//! - [`client`]: session loop and transports
//! - [`models`]: model identifier resolution and download

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod host;
pub mod models;
pub mod security;
pub mod shutdown;
pub mod telemetry;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use config::{ConfigError, EngineKind, EnvConfig};
use engine::{
    identifier_to_format_hint, EngineError, EngineHandle, FormatTag, LlamaServerConfig,
    LlamaServerEngine, TextEngine,
};
use models::{ModelResolver, ResolveError};
use security::Codec;
use telemetry::SecurityEvent;
use worker::Worker;

/// A ready worker: key loaded, model resolved, engine initialized.
pub struct Runtime {
    pub worker: Worker,
    pub engine: EngineKind,
    pub model_path: Option<PathBuf>,
    pub format: Option<FormatTag>,
}

impl Runtime {
    /// Validate configuration and bring up the engine.
    ///
    /// Every error here is a configuration error: the process should exit.
    pub async fn start(config: &EnvConfig) -> Result<Self, ConfigError> {
        let key = config.key.key().map_err(|e| {
            crate::security_log!(SecurityEvent::InvalidKey, "worker key unusable",
                "state" => config.key.describe());
            e
        })?;
        let codec = Codec::new(key);
        let kind = config.engine_kind()?;
        if kind == EngineKind::Gguf && !cfg!(feature = "gguf") {
            return Err(ConfigError::EngineUnavailable);
        }
        let format_override = config.format_override()?;

        let model_path = match (kind, config.models.is_empty()) {
            (EngineKind::Gguf, true) => return Err(ResolveError::NoModels.into()),
            (_, true) => None,
            (_, false) => {
                let resolver = ModelResolver::new(config.model_dir.clone(), config.hf_token.clone());
                Some(resolver.prepare_async(config.models.clone()).await?)
            }
        };

        let format = format_override.or_else(|| {
            model_path
                .as_deref()
                .and_then(|p| identifier_to_format_hint(p))
                .or_else(|| config.models.first().and_then(|m| identifier_to_format_hint(m)))
        });

        info!(
            engine = kind.as_str(),
            model = ?model_path,
            format = format.map(|f| f.as_str()).unwrap_or("engine template"),
            max_model_len = config.max_model_len,
            gpu_memory_utilization = config.gpu_memory_utilization,
            flash_attention = config.flash_attention,
            max_concurrency = config.max_concurrency,
            "starting engine"
        );

        let handle = Arc::new(EngineHandle::new());
        handle
            .ensure_initialized(|| build_engine(kind, config, model_path.clone(), format))
            .await?;
        telemetry::describe_metrics();

        Ok(Self {
            worker: Worker::new(Some(codec), handle),
            engine: kind,
            model_path,
            format,
        })
    }
}

async fn build_engine(
    kind: EngineKind,
    config: &EnvConfig,
    model_path: Option<PathBuf>,
    format: Option<FormatTag>,
) -> Result<Arc<dyn TextEngine>, EngineError> {
    match kind {
        EngineKind::LlamaServer => {
            let engine = LlamaServerEngine::connect(LlamaServerConfig {
                base_url: config.engine_url.clone(),
                format,
                ready_timeout: config.engine_ready_timeout,
                model_alias: config
                    .models
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "local".to_string()),
            })
            .await?;
            Ok(Arc::new(engine))
        }
        EngineKind::Gguf => load_gguf(config, model_path, format).await,
    }
}

#[cfg(feature = "gguf")]
async fn load_gguf(
    config: &EnvConfig,
    model_path: Option<PathBuf>,
    format: Option<FormatTag>,
) -> Result<Arc<dyn TextEngine>, EngineError> {
    use engine::gguf::{GgufEngine, GgufSettings};

    let path = model_path.ok_or_else(|| EngineError::Init("no model resolved".to_string()))?;
    let settings = GgufSettings::from_budget(config.max_model_len, config.gpu_memory_utilization);
    let engine = tokio::task::spawn_blocking(move || GgufEngine::load(&path, &settings, format))
        .await
        .map_err(|e| EngineError::Init(e.to_string()))??;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "gguf"))]
async fn load_gguf(
    _config: &EnvConfig,
    _model_path: Option<PathBuf>,
    _format: Option<FormatTag>,
) -> Result<Arc<dyn TextEngine>, EngineError> {
    Err(EngineError::Init("gguf engine is not compiled in".to_string()))
}
