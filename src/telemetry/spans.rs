//! Span helpers for job tracing.

use tracing::{info_span, Span};

/// Extension trait for recording outcomes on spans.
///
/// Fills `status` with `completed` or `failed`, and `error.kind` on failure.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "completed");
            }
            Err(e) => {
                self.record("status", "failed");
                self.record("error.kind", e.to_string().as_str());
            }
        }
    }
}

/// Factory for per-job spans.
pub struct JobSpan;

impl JobSpan {
    /// `status`, `error.kind`, `latency_ms` and `deltas` are filled in when
    /// the job finishes.
    pub fn new(job_id: &str) -> Span {
        info_span!(
            "job",
            job_id = %job_id,
            status = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            deltas = tracing::field::Empty,
        )
    }
}
