//! Command-line interface for `sealed-llm`.
//!
//! ```bash
//! sealed-llm worker            # serve newline-delimited jobs on stdin/stdout
//! sealed-llm chat --endpoint https://api.runpod.ai/v2/<id>
//! sealed-llm chat --local      # in-process worker, ephemeral key
//! sealed-llm keygen            # print a fresh key
//! sealed-llm resolve           # prefetch SEALED_MODELS
//! sealed-llm config show|validate
//! ```

pub mod chat_cmd;
pub mod config_cmd;
pub mod worker_cmd;

use clap::{Args, Parser, Subcommand};

use crate::client::DEFAULT_SYSTEM_PROMPT;
use crate::envelope::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};

/// Exit code for unusable configuration.
pub const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "sealed-llm")]
#[command(about = "Encrypted request / streamed response proxy for LLM inference")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the worker: jobs on stdin, output chunks on stdout
    Worker,
    /// Interactive encrypted chat session
    Chat(ChatArgs),
    /// Generate a new pre-shared key
    Keygen,
    /// Resolve and download models ahead of time
    Resolve(ResolveArgs),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print version
    Version,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective configuration (secrets omitted)
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Check for problems that would stop the worker from starting
    Validate,
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// System prompt for the session
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system: String,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    #[arg(long, default_value_t = DEFAULT_TOP_P)]
    pub top_p: f32,

    /// Stop sequence; repeatable
    #[arg(long)]
    pub stop: Vec<String>,

    /// Serverless endpoint base URL
    #[arg(long, env = "SEALED_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Endpoint API key
    #[arg(long, env = "SEALED_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Pre-shared encryption key (URL-safe base64)
    #[arg(long, env = "SEALED_ENCRYPTION_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Run a worker in this process instead of calling an endpoint
    #[arg(long)]
    pub local: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// Model identifiers; defaults to SEALED_MODELS
    pub models: Vec<String>,
}
