//! Per-job state machine.
//!
//! `Idle → Decrypting → Parsing → Generating → Streaming → Completed`, with
//! any step able to end in `Failed`. Each failure yields exactly one error
//! item and then the stream ends. The machine is pulled: nothing runs until
//! the consumer asks for the next item.

use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::job::Job;
use super::stream::{ErrorKind, StreamItem};
use crate::engine::{DeltaStreamer, EngineHandle, IncrementStream};
use crate::envelope::{self, GenerationRequest};
use crate::security::Codec;
use crate::security_log;
use crate::telemetry::{self, JobSpan, SecurityEvent, SpanExt};

/// Emitted when an engine finishes without producing any text.
pub const ZERO_OUTPUT_DIAGNOSTIC: &str =
    "engine produced no output; the prompt format likely does not match the model's chat template";

/// Observable job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Decrypting,
    Parsing,
    Generating,
    Streaming,
    Completed,
    Failed(ErrorKind),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_))
    }
}

enum Phase {
    Idle(Job),
    Decrypting(String),
    Parsing(Vec<u8>),
    Generating(GenerationRequest),
    Streaming {
        increments: IncrementStream,
        streamer: DeltaStreamer,
    },
    Completed,
    Failed(ErrorKind),
}

impl Phase {
    fn state(&self) -> JobState {
        match self {
            Phase::Idle(_) => JobState::Idle,
            Phase::Decrypting(_) => JobState::Decrypting,
            Phase::Parsing(_) => JobState::Parsing,
            Phase::Generating(_) => JobState::Generating,
            Phase::Streaming { .. } => JobState::Streaming,
            Phase::Completed => JobState::Completed,
            Phase::Failed(kind) => JobState::Failed(*kind),
        }
    }
}

/// One job in flight.
///
/// Dropping a `JobRun` before it finishes cancels the engine work behind it.
pub struct JobRun {
    job_id: String,
    phase: Phase,
    codec: Option<Codec>,
    engine: Arc<EngineHandle>,
    cancel: CancellationToken,
    deltas: usize,
    span: Span,
    started: Instant,
}

impl JobRun {
    pub(crate) fn new(
        job: Job,
        codec: Option<Codec>,
        engine: Arc<EngineHandle>,
        cancel: CancellationToken,
    ) -> Self {
        let job_id = job.id_or_generate();
        let span = JobSpan::new(&job_id);
        Self {
            job_id,
            phase: Phase::Idle(job),
            codec,
            engine,
            cancel,
            deltas: 0,
            span,
            started: Instant::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        self.phase.state()
    }

    /// Fires when this job is cancelled, by the host or by dropping the run.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Advance until the next item is available, or the job has ended.
    ///
    /// Cancel-safe: the phase stays in `self` across every await, so
    /// dropping this future loses no engine output. A drop while
    /// `Generating` restarts the generation request on the next call.
    pub async fn next_item(&mut self) -> Option<StreamItem> {
        loop {
            match &mut self.phase {
                Phase::Idle(job) => match job.encrypted_input().map(str::to_string) {
                    Some(blob) => self.phase = Phase::Decrypting(blob),
                    None => {
                        security_log!(SecurityEvent::MissingInput, "job has no encrypted_input",
                            "job_id" => self.job_id.as_str());
                        return self.fail(
                            ErrorKind::MissingInput,
                            "job input is missing 'encrypted_input'",
                        );
                    }
                },
                Phase::Decrypting(blob) => {
                    let Some(codec) = &self.codec else {
                        security_log!(SecurityEvent::MissingKey, "job rejected, no key configured",
                            "job_id" => self.job_id.as_str());
                        return self.fail(
                            ErrorKind::SecurityError,
                            "server encryption key is not configured",
                        );
                    };
                    match codec.decrypt(blob) {
                        Ok(plaintext) => self.phase = Phase::Parsing(plaintext),
                        Err(e) => {
                            security_log!(SecurityEvent::DecryptionFailure, "payload rejected",
                                "job_id" => self.job_id.as_str(), "reason" => e.reason.as_str());
                            return self.fail(
                                ErrorKind::SecurityError,
                                "request could not be decrypted with the configured key",
                            );
                        }
                    }
                }
                Phase::Parsing(plaintext) => {
                    let parsed = envelope::parse(plaintext).and_then(|request| {
                        request.validate()?;
                        Ok(request)
                    });
                    match parsed {
                        Ok(request) => {
                            debug!(
                                parent: &self.span,
                                turns = request.conversation.len(),
                                content_bytes = request.content_bytes(),
                                max_tokens = request.parameters.max_tokens,
                                "request accepted"
                            );
                            // Replacing the phase drops the plaintext.
                            self.phase = Phase::Generating(request);
                        }
                        Err(e) => {
                            security_log!(SecurityEvent::MalformedPayload, "payload rejected",
                                "job_id" => self.job_id.as_str());
                            return self.fail(ErrorKind::BadRequest, format!("malformed request: {e}"));
                        }
                    }
                }
                Phase::Generating(request) => {
                    let Some(engine) = self.engine.get() else {
                        return self.fail(ErrorKind::EngineError, "engine is not initialized");
                    };
                    let started = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        started = engine
                            .generate(request, self.cancel.child_token())
                            .instrument(self.span.clone()) => Some(started),
                    };
                    match started {
                        None => {
                            debug!(parent: &self.span, "job cancelled before the engine started");
                            self.finish(Err(ErrorKind::EngineError));
                            return None;
                        }
                        Some(Ok(stream)) => {
                            self.phase = Phase::Streaming {
                                streamer: DeltaStreamer::new(stream.shape),
                                increments: stream.increments,
                            };
                        }
                        Some(Err(e)) => return self.fail(ErrorKind::EngineError, e.to_string()),
                    }
                }
                Phase::Streaming {
                    increments,
                    streamer,
                } => {
                    let next = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        next = increments.next() => Some(next),
                    };
                    // The consumer is gone or the host is shutting down.
                    let Some(next) = next else {
                        debug!(parent: &self.span, "job cancelled while streaming");
                        self.finish(Err(ErrorKind::EngineError));
                        return None;
                    };
                    match next {
                        Some(Ok(increment)) => match streamer.push(increment) {
                            Ok(Some(delta)) => {
                                self.deltas += 1;
                                telemetry::record_delta();
                                return Some(StreamItem::Text(delta));
                            }
                            Ok(None) => {}
                            Err(e) => return self.fail(ErrorKind::EngineError, e.to_string()),
                        },
                        Some(Err(e)) => return self.fail(ErrorKind::EngineError, e.to_string()),
                        None if self.deltas == 0 => {
                            return self.fail(ErrorKind::EngineError, ZERO_OUTPUT_DIAGNOSTIC)
                        }
                        None => {
                            self.finish(Ok(()));
                            return None;
                        }
                    }
                }
                Phase::Completed | Phase::Failed(_) => return None,
            }
        }
    }

    fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Option<StreamItem> {
        let message = message.into();
        warn!(parent: &self.span, kind = kind.as_str(), error = %message, "job failed");
        self.finish(Err(kind));
        Some(StreamItem::Error { kind, message })
    }

    fn finish(&mut self, outcome: Result<(), ErrorKind>) {
        let elapsed = self.started.elapsed();
        self.span.record("latency_ms", elapsed.as_millis() as u64);
        self.span.record("deltas", self.deltas as u64);
        telemetry::record_job_latency(elapsed);
        self.span.record_result(&outcome);
        match outcome {
            Ok(()) => {
                self.phase = Phase::Completed;
                telemetry::record_job_outcome("completed");
                info!(
                    parent: &self.span,
                    deltas = self.deltas,
                    latency_ms = elapsed.as_millis() as u64,
                    "job completed"
                );
            }
            Err(kind) => {
                self.phase = Phase::Failed(kind);
                telemetry::record_job_outcome(kind.as_str());
            }
        }
        self.cancel.cancel();
    }

    /// Drive the job as a stream of items.
    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        futures::stream::unfold(self, |mut run| async move {
            let item = run.next_item().await?;
            Some((item, run))
        })
    }
}

impl Drop for JobRun {
    fn drop(&mut self) {
        if !self.phase.state().is_terminal() {
            debug!(parent: &self.span, job_id = %self.job_id, "job dropped before completion");
        }
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for JobRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRun")
            .field("job_id", &self.job_id)
            .field("state", &self.state())
            .field("deltas", &self.deltas)
            .finish()
    }
}
