//! sealed-llm entry point.
//!
//! - `sealed-llm worker` - serve encrypted jobs (stdin/stdout)
//! - `sealed-llm chat` - interactive client
//! - `sealed-llm keygen` - print a new key
//! - `sealed-llm resolve` - prefetch models
//! - `sealed-llm config show|validate`
//!
//! Exit codes: 0 success, 1 runtime failure, 2 configuration error.

use std::process::ExitCode;

use clap::Parser;

use sealed_llm::cli::{chat_cmd, config_cmd, worker_cmd, Cli, Command, ConfigAction};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Worker => worker_cmd::run_worker().await,
        Command::Chat(args) => chat_cmd::run_chat(args).await,
        Command::Keygen => worker_cmd::run_keygen(),
        Command::Resolve(args) => worker_cmd::run_resolve(args.models).await,
        Command::Config { action } => match action {
            ConfigAction::Show { json } => config_cmd::run_show(json),
            ConfigAction::Validate => config_cmd::run_validate(),
        },
        Command::Version => {
            println!("sealed-llm {}", env!("CARGO_PKG_VERSION"));
            0
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
