//! Items a job yields and their wire form.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a failure reported in-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingInput,
    SecurityError,
    BadRequest,
    EngineError,
    ConfigurationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::SecurityError => "security_error",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::EngineError => "engine_error",
            ErrorKind::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item of a job's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Text(String),
    Error { kind: ErrorKind, message: String },
}

impl StreamItem {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        StreamItem::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamItem::Error { .. })
    }

    pub fn into_chunk(self) -> OutputChunk {
        match self {
            StreamItem::Text(text) => OutputChunk::Text(text),
            StreamItem::Error { kind, message } => OutputChunk::Error {
                error: message,
                kind: Some(kind),
            },
        }
    }
}

/// Wire form of a stream item: a bare string, or `{"error": ..., "kind": ...}`.
///
/// `kind` is optional on input so that plain `{"error": "..."}` objects from
/// other workers still read as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputChunk {
    Text(String),
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
}

impl OutputChunk {
    pub fn is_error(&self) -> bool {
        matches!(self, OutputChunk::Error { .. })
    }
}
