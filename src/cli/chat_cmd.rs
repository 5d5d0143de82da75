//! `chat`: interactive encrypted session against an endpoint or a local worker.

use std::io::Write;

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChatArgs, EXIT_CONFIG};
use crate::client::{
    EndpointConfig, EndpointTransport, LocalTransport, Session, SessionConfig, Transport,
};
use crate::config::{self, KeySetting};
use crate::envelope::{GenerationParams, MalformedPayloadError};
use crate::security::{Codec, Key, KeyError};
use crate::telemetry::{init_logging, LogConfig};
use crate::Runtime;

#[derive(Debug, thiserror::Error)]
enum ChatSetupError {
    #[error("{0}")]
    Params(#[from] MalformedPayloadError),

    #[error("--key: {0}")]
    Key(#[from] KeyError),

    #[error("a key is required (--key or SEALED_ENCRYPTION_KEY) unless --local is used")]
    MissingKey,

    #[error("either --endpoint or --local is required")]
    NoTarget,
}

pub async fn run_chat(args: ChatArgs) -> i32 {
    let _ = init_logging(&LogConfig::interactive());

    let setup = build_params(&args).and_then(|params| Ok((params, session_key(&args)?)));
    let (params, key) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("error: {e}");
            return i32::from(EXIT_CONFIG);
        }
    };
    let session_config = SessionConfig {
        system_prompt: args.system.clone(),
        params,
    };
    let codec = Codec::new(&key);

    if args.local {
        let mut config = config::load();
        config.key = KeySetting::Present(key);
        let runtime = match Runtime::start(&config).await {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return i32::from(EXIT_CONFIG);
            }
        };
        let transport = LocalTransport::new(runtime.worker);
        return run_session(Session::new(session_config, codec, transport)).await;
    }

    let Some(endpoint) = args.endpoint.clone() else {
        eprintln!("error: {}", ChatSetupError::NoTarget);
        return i32::from(EXIT_CONFIG);
    };
    match EndpointTransport::new(EndpointConfig::new(endpoint, args.api_key.clone())) {
        Ok(transport) => run_session(Session::new(session_config, codec, transport)).await,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn build_params(args: &ChatArgs) -> Result<GenerationParams, ChatSetupError> {
    let params = GenerationParams {
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        top_p: args.top_p,
        stop: Vec::new(),
    }
    .with_stop(args.stop.iter().cloned());
    params.validate()?;
    Ok(params)
}

/// A local session without a configured key gets a throwaway one.
fn session_key(args: &ChatArgs) -> Result<Key, ChatSetupError> {
    match args.key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        Some(text) => Ok(Key::from_base64(text)?),
        None if args.local => {
            eprintln!("using an ephemeral key for this session");
            Ok(Key::generate())
        }
        None => Err(ChatSetupError::MissingKey),
    }
}

async fn run_session<T: Transport>(mut session: Session<T>) -> i32 {
    let interrupt = CancellationToken::new();
    let watcher = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    let result = session.run(stdin, &mut stdout, interrupt).await;
    let _ = stdout.flush();
    match result {
        Ok(end) => {
            debug!(end = ?end, turns = session.history().len(), "session ended");
            0
        }
        Err(e) => {
            eprintln!("chat failed: {e}");
            1
        }
    }
}
