//! `config show` and `config validate`.
//!
//! Both read the environment directly; nothing is started.

use crate::config::{self, EffectiveConfig};

/// Print the effective configuration to stdout.
pub fn run_show(json: bool) -> i32 {
    let cfg = config::load().effective_config();
    if json {
        match serde_json::to_string_pretty(&cfg) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("failed to encode configuration: {e}");
                return 1;
            }
        }
    } else {
        for line in config_lines(&cfg) {
            println!("{line}");
        }
    }
    0
}

/// Returns 0 when the worker could start, 1 otherwise.
pub fn run_validate() -> i32 {
    let env = config::load();
    let problems = env.problems();
    if problems.is_empty() {
        println!("Configuration is valid.");
        return 0;
    }
    for problem in &problems {
        eprintln!("ERROR: {problem}");
    }
    1
}

fn config_lines(cfg: &EffectiveConfig) -> Vec<String> {
    vec![
        format!("SEALED_ENCRYPTION_KEY=<{}>", cfg.encryption_key),
        format!("SEALED_MODELS={}", cfg.models.join(",")),
        format!("SEALED_MODEL_DIR={}", cfg.model_dir.display()),
        format!("SEALED_MAX_MODEL_LEN={}", cfg.max_model_len),
        format!("SEALED_GPU_MEMORY_UTILIZATION={:.2}", cfg.gpu_memory_utilization),
        format!("SEALED_MAX_CONCURRENCY={}", cfg.max_concurrency),
        format!("SEALED_CHAT_FORMAT={}", cfg.chat_format),
        format!("SEALED_FLASH_ATTENTION={}", cfg.flash_attention),
        format!("SEALED_ENGINE={}", cfg.engine),
        format!("SEALED_ENGINE_URL={}", cfg.engine_url),
        format!("SEALED_ENGINE_READY_TIMEOUT={}", cfg.engine_ready_timeout_secs),
        format!("SEALED_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs),
        format!("SEALED_LOG_FORMAT={}", cfg.log_format),
        format!("SEALED_LOG={}", cfg.log_level),
        format!("HF_TOKEN=<{}>", if cfg.hf_token { "set" } else { "unset" }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{clear_env_vars, ENV_LOCK};
    use crate::security::Key;

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_validate_fails_without_key() {
        let _lock = lock();
        clear_env_vars();
        assert_eq!(run_validate(), 1);
    }

    #[test]
    fn test_validate_passes_with_key() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("SEALED_ENCRYPTION_KEY", Key::generate().to_base64());
        assert_eq!(run_validate(), 0);
        clear_env_vars();
    }

    #[test]
    fn test_show_lines_hide_key() {
        let _lock = lock();
        clear_env_vars();
        let text = Key::generate().to_base64();
        std::env::set_var("SEALED_ENCRYPTION_KEY", &text);
        let lines = config_lines(&config::load().effective_config());
        assert_eq!(lines[0], "SEALED_ENCRYPTION_KEY=<configured>");
        assert!(lines.iter().all(|l| !l.contains(&text)));
        assert_eq!(run_show(true), 0);
        clear_env_vars();
    }
}
