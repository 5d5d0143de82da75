//! Interactive multi-turn session.

use std::io::Write;

use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ClientError, Transport};
use crate::envelope::{self, GenerationParams, GenerationRequest, Role, Turn};
use crate::security::Codec;
use crate::worker::{ErrorKind, OutputChunk};

/// Lines that end the session, compared case-insensitively.
pub const EXIT_COMMANDS: &[&str] = &["exit", "quit", "/exit", "/quit"];

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub params: GenerationParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            params: GenerationParams::default(),
        }
    }
}

/// Conversation so far: one system turn, then complete user/assistant pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHistory {
    turns: Vec<Turn>,
}

impl SessionHistory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Conversation to send: history plus the pending user turn.
    fn with_pending(&self, user: &str) -> Vec<Turn> {
        let mut conversation = Vec::with_capacity(self.turns.len() + 1);
        conversation.extend_from_slice(&self.turns);
        conversation.push(Turn::user(user));
        conversation
    }

    fn commit(&mut self, user: &str, assistant: String) {
        self.turns.push(Turn::user(user));
        self.turns.push(Turn::assistant(assistant));
    }

    /// Roles alternate user/assistant after the leading system turn.
    pub fn is_well_formed(&self) -> bool {
        let mut turns = self.turns.iter();
        if turns.next().map(|t| t.role) != Some(Role::System) {
            return false;
        }
        let rest: Vec<Role> = turns.map(|t| t.role).collect();
        rest.len() % 2 == 0
            && rest
                .chunks(2)
                .all(|pair| pair == [Role::User, Role::Assistant])
    }
}

/// Result of one request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Reply received and committed to history.
    Completed(String),
    /// The worker reported an error; nothing was committed.
    Rejected {
        kind: Option<ErrorKind>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// An exit command was entered.
    Exited,
    /// Input closed.
    EndOfInput,
    /// The user interrupted.
    Interrupted,
}

pub struct Session<T: Transport> {
    config: SessionConfig,
    codec: Codec,
    transport: T,
    history: SessionHistory,
}

impl<T: Transport> Session<T> {
    pub fn new(config: SessionConfig, codec: Codec, transport: T) -> Self {
        let history = SessionHistory::new(config.system_prompt.clone());
        Self {
            config,
            codec,
            transport,
            history,
        }
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    /// Send one user message, writing reply text to `out` as it arrives.
    ///
    /// History changes only when the reply completes, so dropping this
    /// future mid-stream leaves history as it was.
    pub async fn send<W: Write>(
        &mut self,
        user: &str,
        out: &mut W,
    ) -> Result<TurnOutcome, ClientError> {
        let request = GenerationRequest::new(
            self.history.with_pending(user),
            self.config.params.clone(),
        );
        let plaintext = envelope::serialize(&request)?;
        let blob = self.codec.encrypt(&plaintext)?;
        drop(plaintext);

        let mut reply = self.transport.submit(blob).await?;
        let mut text = String::new();
        while let Some(chunk) = reply.next().await {
            match chunk? {
                OutputChunk::Text(delta) => {
                    out.write_all(delta.as_bytes())?;
                    out.flush()?;
                    text.push_str(&delta);
                }
                OutputChunk::Error { error, kind } => {
                    debug!(kind = ?kind, "turn rejected by worker");
                    return Ok(TurnOutcome::Rejected {
                        kind,
                        message: error,
                    });
                }
            }
        }
        self.history.commit(user, text.clone());
        Ok(TurnOutcome::Completed(text))
    }

    /// Read lines from `input` until EOF, an exit command, or `interrupt`.
    pub async fn run<R, W>(
        &mut self,
        input: R,
        out: &mut W,
        interrupt: CancellationToken,
    ) -> Result<SessionEnd, ClientError>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        loop {
            write!(out, "> ")?;
            out.flush()?;

            let line = tokio::select! {
                biased;
                _ = interrupt.cancelled() => None,
                line = lines.next_line() => Some(line?),
            };
            let line = match line {
                None => return self.interrupted(out),
                Some(None) => {
                    writeln!(out)?;
                    return Ok(SessionEnd::EndOfInput);
                }
                Some(Some(line)) => line,
            };
            let message = line.trim();
            if message.is_empty() {
                continue;
            }
            if is_exit_command(message) {
                return Ok(SessionEnd::Exited);
            }

            let outcome = tokio::select! {
                biased;
                _ = interrupt.cancelled() => None,
                outcome = self.send(message, out) => Some(outcome),
            };
            match outcome {
                None => return self.interrupted(out),
                Some(Ok(TurnOutcome::Completed(_))) => writeln!(out)?,
                Some(Ok(TurnOutcome::Rejected { kind, message })) => {
                    let kind = kind.map(|k| k.as_str()).unwrap_or("error");
                    writeln!(out, "\n[{kind}] {message}")?;
                }
                Some(Err(ClientError::Io(e))) => return Err(ClientError::Io(e)),
                Some(Err(e)) => {
                    warn!(error = %e, "turn failed");
                    writeln!(out, "\n[error] {e}")?;
                }
            }
        }
    }

    fn interrupted<W: Write>(&self, out: &mut W) -> Result<SessionEnd, ClientError> {
        writeln!(out, "\n[interrupted]")?;
        Ok(SessionEnd::Interrupted)
    }
}

pub fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    EXIT_COMMANDS.iter().any(|cmd| line.eq_ignore_ascii_case(cmd))
}
