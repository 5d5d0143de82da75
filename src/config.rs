//! Worker configuration from environment variables.
//!
//! Values come from `SEALED_*` variables with defaults. Invalid numbers fall
//! back to defaults; the key is the only value whose absence stops the worker.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SEALED_ENCRYPTION_KEY` | (none) | Pre-shared key, URL-safe base64 |
//! | `SEALED_MODELS` | (none) | Comma-separated model identifiers |
//! | `SEALED_MODEL_DIR` | `/models` | Model cache directory |
//! | `SEALED_MAX_MODEL_LEN` | 4096 | Context length limit (tokens) |
//! | `SEALED_GPU_MEMORY_UTILIZATION` | 0.90 | GPU memory fraction |
//! | `SEALED_MAX_CONCURRENCY` | 4 | Concurrent jobs |
//! | `SEALED_CHAT_FORMAT` | `auto` | Prompt format override |
//! | `SEALED_FLASH_ATTENTION` | false | Flash attention toggle |
//! | `SEALED_ENGINE` | `llama-server` | `llama-server` or `gguf` |
//! | `SEALED_ENGINE_URL` | `http://127.0.0.1:8080` | llama-server base URL |
//! | `SEALED_ENGINE_READY_TIMEOUT` | 30 | Engine readiness wait (secs) |
//! | `SEALED_SHUTDOWN_TIMEOUT` | 30 | Drain timeout (secs) |
//! | `SEALED_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `SEALED_LOG` | `info` | Log filter directive |
//! | `HF_TOKEN` | (none) | Model registry token |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::engine::format::UnknownFormat;
use crate::engine::{EngineError, FormatTag};
use crate::models::ResolveError;
use crate::security::{Key, KeyError};
use crate::telemetry::{LogConfig, LogFormat};

pub const KEY_VAR: &str = "SEALED_ENCRYPTION_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SEALED_ENCRYPTION_KEY is not set")]
    MissingKey,

    #[error("SEALED_ENCRYPTION_KEY is invalid: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("unknown engine '{0}' (expected llama-server or gguf)")]
    UnknownEngine(String),

    #[error("SEALED_CHAT_FORMAT: {0}")]
    Format(#[from] UnknownFormat),

    #[error("model resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("engine initialization failed: {0}")]
    Engine(#[from] EngineError),

    #[error("the gguf engine is not compiled in (build with --features gguf)")]
    EngineUnavailable,

    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// Which engine backs the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    LlamaServer,
    Gguf,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::LlamaServer => "llama-server",
            EngineKind::Gguf => "gguf",
        }
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llama-server" | "llama_server" | "server" => Ok(EngineKind::LlamaServer),
            "gguf" | "llama-cpp" | "in-process" => Ok(EngineKind::Gguf),
            other => Err(ConfigError::UnknownEngine(other.to_string())),
        }
    }
}

/// The key as configured. Parsing happens at load time; reporting is left to
/// the caller.
#[derive(Clone)]
pub enum KeySetting {
    Missing,
    Invalid(KeyError),
    Present(Key),
}

impl KeySetting {
    fn from_env() -> Self {
        match std::env::var(KEY_VAR) {
            Ok(text) if !text.trim().is_empty() => match Key::from_base64(text.trim()) {
                Ok(key) => KeySetting::Present(key),
                Err(e) => KeySetting::Invalid(e),
            },
            _ => KeySetting::Missing,
        }
    }

    pub fn key(&self) -> Result<&Key, ConfigError> {
        match self {
            KeySetting::Present(key) => Ok(key),
            KeySetting::Invalid(e) => Err(ConfigError::InvalidKey(e.clone())),
            KeySetting::Missing => Err(ConfigError::MissingKey),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            KeySetting::Missing => "missing",
            KeySetting::Invalid(_) => "invalid",
            KeySetting::Present(_) => "configured",
        }
    }
}

impl fmt::Debug for KeySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Effective configuration summary. Never contains secrets.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub encryption_key: &'static str,
    pub models: Vec<String>,
    pub model_dir: PathBuf,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f32,
    pub max_concurrency: usize,
    pub chat_format: String,
    pub flash_attention: bool,
    pub engine: String,
    pub engine_url: String,
    pub engine_ready_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub log_format: &'static str,
    pub log_level: String,
    pub hf_token: bool,
}

#[derive(Clone)]
pub struct EnvConfig {
    pub key: KeySetting,
    pub models: Vec<String>,
    pub model_dir: PathBuf,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f32,
    pub max_concurrency: usize,
    /// Raw override; see [`EnvConfig::format_override`].
    pub chat_format: String,
    pub flash_attention: bool,
    /// Raw engine name; see [`EnvConfig::engine_kind`].
    pub engine: String,
    pub engine_url: String,
    pub engine_ready_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub log: LogConfig,
    pub hf_token: Option<String>,
}

impl fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.effective_config(), f)
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_f32(key: &str, default: f32) -> f32 {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val.trim().to_string(),
        _ => default.to_string(),
    }
}

fn parse_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|val| {
            val.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn load_log_config() -> LogConfig {
    let format = std::env::var("SEALED_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or_default();
    LogConfig {
        format,
        level: parse_string("SEALED_LOG", "info"),
        output_path: None,
    }
}

/// Load configuration from the environment. Never fails.
pub fn load() -> EnvConfig {
    let max_model_len = parse_u32("SEALED_MAX_MODEL_LEN", 4096).max(128);
    let gpu_memory_utilization = parse_f32("SEALED_GPU_MEMORY_UTILIZATION", 0.90).clamp(0.0, 1.0);
    let max_concurrency = parse_usize("SEALED_MAX_CONCURRENCY", 4).max(1);
    let ready_secs = parse_u64("SEALED_ENGINE_READY_TIMEOUT", 30).max(1);
    let shutdown_secs = parse_u64("SEALED_SHUTDOWN_TIMEOUT", 30).max(1);

    EnvConfig {
        key: KeySetting::from_env(),
        models: parse_list("SEALED_MODELS"),
        model_dir: PathBuf::from(parse_string("SEALED_MODEL_DIR", "/models")),
        max_model_len,
        gpu_memory_utilization,
        max_concurrency,
        chat_format: parse_string("SEALED_CHAT_FORMAT", "auto"),
        flash_attention: parse_bool("SEALED_FLASH_ATTENTION", false),
        engine: parse_string("SEALED_ENGINE", "llama-server"),
        engine_url: parse_string("SEALED_ENGINE_URL", "http://127.0.0.1:8080"),
        engine_ready_timeout: Duration::from_secs(ready_secs),
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        log: load_log_config(),
        hf_token: std::env::var("HF_TOKEN").ok().filter(|t| !t.trim().is_empty()),
    }
}

impl EnvConfig {
    pub fn engine_kind(&self) -> Result<EngineKind, ConfigError> {
        self.engine.parse()
    }

    /// `None` for `auto`.
    pub fn format_override(&self) -> Result<Option<FormatTag>, ConfigError> {
        Ok(FormatTag::parse_setting(&self.chat_format)?)
    }

    /// Every problem that would stop the worker from starting.
    pub fn problems(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();
        if let Err(e) = self.key.key() {
            problems.push(e);
        }
        match self.engine_kind() {
            Err(e) => problems.push(e),
            Ok(EngineKind::Gguf) if self.models.is_empty() => {
                problems.push(ConfigError::Resolve(ResolveError::NoModels))
            }
            Ok(EngineKind::Gguf) if !cfg!(feature = "gguf") => {
                problems.push(ConfigError::EngineUnavailable)
            }
            Ok(_) => {}
        }
        if let Err(e) = self.format_override() {
            problems.push(e);
        }
        problems
    }

    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            encryption_key: self.key.describe(),
            models: self.models.clone(),
            model_dir: self.model_dir.clone(),
            max_model_len: self.max_model_len,
            gpu_memory_utilization: self.gpu_memory_utilization,
            max_concurrency: self.max_concurrency,
            chat_format: self.chat_format.clone(),
            flash_attention: self.flash_attention,
            engine: self.engine.clone(),
            engine_url: self.engine_url.clone(),
            engine_ready_timeout_secs: self.engine_ready_timeout.as_secs(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            log_format: self.log.format.as_str(),
            log_level: self.log.level.clone(),
            hf_token: self.hf_token.is_some(),
        }
    }
}

/// Serializes tests that touch process environment.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) const ENV_KEYS: &[&str] = &[
    "SEALED_ENCRYPTION_KEY",
    "SEALED_MODELS",
    "SEALED_MODEL_DIR",
    "SEALED_MAX_MODEL_LEN",
    "SEALED_GPU_MEMORY_UTILIZATION",
    "SEALED_MAX_CONCURRENCY",
    "SEALED_CHAT_FORMAT",
    "SEALED_FLASH_ATTENTION",
    "SEALED_ENGINE",
    "SEALED_ENGINE_URL",
    "SEALED_ENGINE_READY_TIMEOUT",
    "SEALED_SHUTDOWN_TIMEOUT",
    "SEALED_LOG_FORMAT",
    "SEALED_LOG",
    "HF_TOKEN",
];

#[cfg(test)]
pub(crate) fn clear_env_vars() {
    for k in ENV_KEYS {
        std::env::remove_var(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = lock();
        clear_env_vars();
        let cfg = load();
        assert!(matches!(cfg.key, KeySetting::Missing));
        assert!(cfg.models.is_empty());
        assert_eq!(cfg.model_dir, PathBuf::from("/models"));
        assert_eq!(cfg.max_model_len, 4096);
        assert!((cfg.gpu_memory_utilization - 0.90).abs() < f32::EPSILON);
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.chat_format, "auto");
        assert!(!cfg.flash_attention);
        assert_eq!(cfg.engine_kind().unwrap(), EngineKind::LlamaServer);
        assert_eq!(cfg.engine_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.shutdown_timeout.as_secs(), 30);
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("SEALED_MODELS", "a/b:Q4_K_M, c/d ,,");
        std::env::set_var("SEALED_MAX_MODEL_LEN", "8192");
        std::env::set_var("SEALED_MAX_CONCURRENCY", "16");
        std::env::set_var("SEALED_CHAT_FORMAT", "chatml");
        std::env::set_var("SEALED_FLASH_ATTENTION", "true");
        std::env::set_var("SEALED_ENGINE", "gguf");
        std::env::set_var("SEALED_LOG_FORMAT", "pretty");
        let cfg = load();
        assert_eq!(cfg.models, vec!["a/b:Q4_K_M", "c/d"]);
        assert_eq!(cfg.max_model_len, 8192);
        assert_eq!(cfg.max_concurrency, 16);
        assert_eq!(cfg.format_override().unwrap(), Some(FormatTag::ChatMl));
        assert!(cfg.flash_attention);
        assert_eq!(cfg.engine_kind().unwrap(), EngineKind::Gguf);
        assert_eq!(cfg.log.format, LogFormat::Pretty);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("SEALED_MAX_MODEL_LEN", "lots");
        std::env::set_var("SEALED_GPU_MEMORY_UTILIZATION", "NaN");
        std::env::set_var("SEALED_FLASH_ATTENTION", "maybe");
        std::env::set_var("SEALED_LOG_FORMAT", "xml");
        let cfg = load();
        assert_eq!(cfg.max_model_len, 4096);
        assert!((cfg.gpu_memory_utilization - 0.90).abs() < f32::EPSILON);
        assert!(!cfg.flash_attention);
        assert_eq!(cfg.log.format, LogFormat::Json);
        clear_env_vars();
    }

    #[test]
    fn test_floors_and_clamps() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("SEALED_MAX_MODEL_LEN", "16");
        std::env::set_var("SEALED_GPU_MEMORY_UTILIZATION", "1.7");
        std::env::set_var("SEALED_MAX_CONCURRENCY", "0");
        std::env::set_var("SEALED_SHUTDOWN_TIMEOUT", "0");
        let cfg = load();
        assert_eq!(cfg.max_model_len, 128);
        assert!((cfg.gpu_memory_utilization - 1.0).abs() < f32::EPSILON);
        assert_eq!(cfg.max_concurrency, 1);
        assert_eq!(cfg.shutdown_timeout.as_secs(), 1);
        clear_env_vars();
    }

    #[test]
    fn test_key_settings() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var(KEY_VAR, "not-a-key");
        let cfg = load();
        assert!(matches!(cfg.key.key(), Err(ConfigError::InvalidKey(_))));

        let key = Key::generate();
        std::env::set_var(KEY_VAR, key.to_base64());
        let cfg = load();
        assert!(cfg.key.key().is_ok());
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_hides_secrets() {
        let _lock = lock();
        clear_env_vars();
        let key = Key::generate();
        let text = key.to_base64();
        std::env::set_var(KEY_VAR, &text);
        std::env::set_var("HF_TOKEN", "hf_secret_token");
        let cfg = load();
        let json = serde_json::to_string(&cfg.effective_config()).unwrap();
        assert!(!json.contains(&text));
        assert!(!json.contains("hf_secret_token"));
        assert!(!format!("{cfg:?}").contains(&text));
        assert!(!format!("{cfg:?}").contains("hf_secret_token"));
        clear_env_vars();
    }

    #[test]
    fn test_problems() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("SEALED_ENGINE", "vllm");
        std::env::set_var("SEALED_CHAT_FORMAT", "alpaca");
        let cfg = load();
        let problems = cfg.problems();
        assert!(problems.iter().any(|p| matches!(p, ConfigError::MissingKey)));
        assert!(problems.iter().any(|p| matches!(p, ConfigError::UnknownEngine(_))));
        assert!(problems.iter().any(|p| matches!(p, ConfigError::Format(_))));
        clear_env_vars();
    }
}
