//! Telemetry for sealed-llm.
//!
//! Structured logging, job spans, security audit events and metrics. Log
//! output goes to stderr; stdout is reserved for job and chat output.
//! Nothing here ever records payload content.

mod logging;
mod metrics;
pub mod security_log;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{describe_metrics, record_delta, record_job_outcome, record_job_latency};
pub use security_log::{log_security_event, SecurityEvent, SecuritySeverity};
pub use spans::{JobSpan, SpanExt};
