//! Serverless endpoint transport.
//!
//! Submits with `POST {endpoint}/run` and follows the job by polling
//! `GET {endpoint}/stream/{id}` until it reaches a terminal status.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ReplyStream, Transport, TransportError};
use crate::security::EncryptedBlob;
use crate::worker::OutputChunk;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// e.g. `https://api.runpod.ai/v2/<endpoint-id>`
    pub base_url: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            poll_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Job status as reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Completed,
    Failed(String),
}

impl PollStatus {
    pub fn classify(status: &str) -> Self {
        match status {
            "COMPLETED" => PollStatus::Completed,
            "FAILED" | "CANCELLED" | "TIMED_OUT" => PollStatus::Failed(status.to_string()),
            _ => PollStatus::Pending,
        }
    }
}

#[derive(Serialize)]
struct RunRequest<'a> {
    input: RunInput<'a>,
}

#[derive(Serialize)]
struct RunInput<'a> {
    encrypted_input: &'a str,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    stream: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    output: OutputChunk,
}

pub struct EndpointTransport {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl EndpointTransport {
    pub fn new(config: EndpointConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl Transport for EndpointTransport {
    async fn submit(&self, blob: EncryptedBlob) -> Result<ReplyStream, TransportError> {
        let body = RunRequest {
            input: RunInput {
                encrypted_input: blob.as_str(),
            },
        };
        let response = self
            .authorized(self.client.post(self.url("/run")))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let run: RunResponse = response.json().await?;
        debug!(job_id = %run.id, "job submitted");

        let poll = Poller {
            client: self.client.clone(),
            request: self.authorized(self.client.get(self.url(&format!("/stream/{}", run.id)))),
            interval: self.config.poll_interval,
            pending: VecDeque::new(),
            terminal: None,
            saw_error: false,
            first: true,
        };
        Ok(futures::stream::unfold(poll, |mut poll| async move {
            let item = poll.next().await?;
            Some((item, poll))
        })
        .boxed())
    }
}

struct Poller {
    client: reqwest::Client,
    request: reqwest::RequestBuilder,
    interval: Duration,
    pending: VecDeque<OutputChunk>,
    terminal: Option<PollStatus>,
    saw_error: bool,
    first: bool,
}

impl Poller {
    async fn next(&mut self) -> Option<Result<OutputChunk, TransportError>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                self.saw_error |= chunk.is_error();
                return Some(Ok(chunk));
            }
            match self.terminal.take() {
                Some(PollStatus::Failed(status)) if !self.saw_error => {
                    self.terminal = Some(PollStatus::Completed);
                    return Some(Err(TransportError::JobFailed(status)));
                }
                Some(_) => {
                    self.terminal = Some(PollStatus::Completed);
                    return None;
                }
                None => {}
            }
            if !self.first {
                tokio::time::sleep(self.interval).await;
            }
            self.first = false;
            match self.poll_once().await {
                Ok(status) => {
                    if status != PollStatus::Pending {
                        self.terminal = Some(status);
                    }
                }
                Err(e) => {
                    self.terminal = Some(PollStatus::Completed);
                    return Some(Err(e));
                }
            }
        }
    }

    async fn poll_once(&mut self) -> Result<PollStatus, TransportError> {
        let request = self
            .request
            .try_clone()
            .ok_or_else(|| TransportError::Protocol("poll request is not cloneable".into()))?;
        let response = self.client.execute(request.build()?).await?.error_for_status()?;
        let body: StreamResponse = response.json().await?;
        Ok(self.absorb(body))
    }

    fn absorb(&mut self, body: StreamResponse) -> PollStatus {
        self.pending
            .extend(body.stream.into_iter().map(|entry| entry.output));
        PollStatus::classify(&body.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ErrorKind;

    fn poller() -> Poller {
        let client = reqwest::Client::new();
        Poller {
            request: client.get("http://127.0.0.1:9/stream/x"),
            client,
            interval: Duration::from_millis(1),
            pending: VecDeque::new(),
            terminal: None,
            saw_error: false,
            first: true,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(PollStatus::classify("IN_QUEUE"), PollStatus::Pending);
        assert_eq!(PollStatus::classify("IN_PROGRESS"), PollStatus::Pending);
        assert_eq!(PollStatus::classify("COMPLETED"), PollStatus::Completed);
        assert_eq!(
            PollStatus::classify("TIMED_OUT"),
            PollStatus::Failed("TIMED_OUT".into())
        );
    }

    #[test]
    fn test_stream_response_parsing() {
        let body: StreamResponse = serde_json::from_str(
            r#"{"status":"IN_PROGRESS","stream":[{"output":"4"},{"output":{"error":"x","kind":"engine_error"}}]}"#,
        )
        .unwrap();
        let mut p = poller();
        assert_eq!(p.absorb(body), PollStatus::Pending);
        assert_eq!(p.pending[0], OutputChunk::Text("4".into()));
        assert_eq!(
            p.pending[1],
            OutputChunk::Error {
                error: "x".into(),
                kind: Some(ErrorKind::EngineError)
            }
        );
    }

    #[test]
    fn test_empty_stream_response() {
        let body: StreamResponse = serde_json::from_str(r#"{"status":"IN_QUEUE"}"#).unwrap();
        assert!(body.stream.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_without_error_chunk() {
        let mut p = poller();
        p.pending.push_back(OutputChunk::Text("partial".into()));
        p.terminal = Some(PollStatus::Failed("FAILED".into()));
        assert!(matches!(p.next().await, Some(Ok(OutputChunk::Text(_)))));
        assert!(matches!(p.next().await, Some(Err(TransportError::JobFailed(_)))));
        assert!(p.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_job_with_error_chunk_ends_quietly() {
        let mut p = poller();
        p.pending.push_back(OutputChunk::Error {
            error: "denied".into(),
            kind: Some(ErrorKind::SecurityError),
        });
        p.terminal = Some(PollStatus::Failed("FAILED".into()));
        assert!(matches!(p.next().await, Some(Ok(OutputChunk::Error { .. }))));
        assert!(p.next().await.is_none());
    }

    #[test]
    fn test_run_request_shape() {
        let blob = EncryptedBlob::from("abc".to_string());
        let body = RunRequest {
            input: RunInput {
                encrypted_input: blob.as_str(),
            },
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"input":{"encrypted_input":"abc"}}"#
        );
    }
}
