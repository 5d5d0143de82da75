//! Security audit logging.
//!
//! Events carry the job id and a failure category, never key material or
//! payload content.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    /// A blob failed to decode or authenticate.
    DecryptionFailure,
    /// A job arrived while no key is configured.
    MissingKey,
    /// A job arrived without an encrypted payload.
    MissingInput,
    /// A payload decrypted but did not describe a valid request.
    MalformedPayload,
    /// The configured key could not be parsed at startup.
    InvalidKey,
}

impl SecurityEvent {
    pub fn severity(&self) -> SecuritySeverity {
        match self {
            Self::DecryptionFailure => SecuritySeverity::Warning,
            Self::MissingKey => SecuritySeverity::Critical,
            Self::MissingInput => SecuritySeverity::Info,
            Self::MalformedPayload => SecuritySeverity::Warning,
            Self::InvalidKey => SecuritySeverity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecryptionFailure => "decryption_failure",
            Self::MissingKey => "missing_key",
            Self::MissingInput => "missing_input",
            Self::MalformedPayload => "malformed_payload",
            Self::InvalidKey => "invalid_key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecuritySeverity {
    Info,
    Warning,
    Critical,
}

impl SecuritySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Log a security event with structured details.
///
/// ```
/// use sealed_llm::telemetry::{log_security_event, SecurityEvent};
///
/// log_security_event(
///     SecurityEvent::DecryptionFailure,
///     "payload rejected",
///     &[("job_id", "job-1"), ("reason", "authentication")],
/// );
/// ```
pub fn log_security_event(event: SecurityEvent, message: &str, details: &[(&str, &str)]) {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let details_str = details
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");

    let severity = event.severity();
    let event_type = event.as_str();
    let line = if details_str.is_empty() {
        format!("[{timestamp}] SECURITY {} {event_type}: {message}", severity.as_str())
    } else {
        format!(
            "[{timestamp}] SECURITY {} {event_type}: {message} | {details_str}",
            severity.as_str()
        )
    };

    match severity {
        SecuritySeverity::Info => tracing::info!(security_event = event_type, "{}", line),
        SecuritySeverity::Warning => tracing::warn!(security_event = event_type, "{}", line),
        SecuritySeverity::Critical => tracing::error!(security_event = event_type, "{}", line),
    }
}

/// Shorthand for [`log_security_event`].
#[macro_export]
macro_rules! security_log {
    ($event:expr, $message:expr) => {
        $crate::telemetry::security_log::log_security_event($event, $message, &[])
    };
    ($event:expr, $message:expr, $($key:expr => $value:expr),+) => {
        $crate::telemetry::security_log::log_security_event(
            $event,
            $message,
            &[$(($key, $value)),+]
        )
    };
}
