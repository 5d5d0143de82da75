//! Job counters through the `metrics` facade.
//!
//! No exporter is installed here; without a recorder these are no-ops.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

pub fn describe_metrics() {
    describe_counter!("sealed_jobs_total", "Jobs finished, by outcome");
    describe_counter!("sealed_deltas_total", Unit::Count, "Text deltas streamed");
    describe_histogram!("sealed_job_duration_seconds", Unit::Seconds, "Job wall time");
}

/// `outcome` is `completed` or an error kind.
pub fn record_job_outcome(outcome: &'static str) {
    counter!("sealed_jobs_total", "outcome" => outcome).increment(1);
}

pub fn record_delta() {
    counter!("sealed_deltas_total").increment(1);
}

pub fn record_job_latency(elapsed: Duration) {
    histogram!("sealed_job_duration_seconds").record(elapsed.as_secs_f64());
}
