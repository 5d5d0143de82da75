//! `worker`, `resolve` and `keygen`.

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::EXIT_CONFIG;
use crate::config;
use crate::host::{self, HostConfig};
use crate::models::ModelResolver;
use crate::security::Key;
use crate::telemetry::{init_logging, LogConfig};
use crate::Runtime;

/// Serve jobs on stdin/stdout until input closes or a signal arrives.
pub async fn run_worker() -> i32 {
    let config = config::load();
    if let Err(e) = init_logging(&config.log) {
        eprintln!("logging setup failed: {e}");
        return i32::from(EXIT_CONFIG);
    }
    info!(config = ?config.effective_config(), "worker starting");

    let runtime = match Runtime::start(&config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "worker startup failed");
            eprintln!("configuration error: {e}");
            return i32::from(EXIT_CONFIG);
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    let host_config = HostConfig {
        max_concurrency: config.max_concurrency,
        shutdown_timeout: config.shutdown_timeout,
    };
    let stdin = BufReader::new(tokio::io::stdin());
    match host::serve(runtime.worker, stdin, tokio::io::stdout(), &host_config, shutdown).await {
        Ok(report) => {
            info!(completed = report.completed, failed = report.failed, "worker stopped");
            0
        }
        Err(e) => {
            error!(error = %e, "worker failed");
            1
        }
    }
}

fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Resolve each identifier and print its local path.
pub async fn run_resolve(models: Vec<String>) -> i32 {
    let config = config::load();
    let _ = init_logging(&LogConfig::interactive());

    let models = if models.is_empty() { config.models.clone() } else { models };
    if models.is_empty() {
        eprintln!("no models given and SEALED_MODELS is empty");
        return i32::from(EXIT_CONFIG);
    }

    let resolver = ModelResolver::new(config.model_dir.clone(), config.hf_token.clone());
    for model in models {
        let resolver = resolver.clone();
        let id = model.clone();
        match tokio::task::spawn_blocking(move || resolver.resolve(&id)).await {
            Ok(Ok(path)) => println!("{model}\t{}", path.display()),
            Ok(Err(e)) => {
                eprintln!("{model}: {e}");
                return 1;
            }
            Err(e) => {
                eprintln!("{model}: resolver task failed: {e}");
                return 1;
            }
        }
    }
    0
}

pub fn run_keygen() -> i32 {
    println!("{}", Key::generate().to_base64());
    0
}
