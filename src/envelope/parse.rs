//! Wire shapes for the decrypted payload.
//!
//! Parsing walks a `serde_json::Value` by hand so error messages name the
//! offending field without ever echoing payload content.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::{GenerationParams, GenerationRequest, Role, Turn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedPayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload is not valid JSON (line {line}, column {column})")]
    InvalidJson { line: usize, column: usize },

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("payload carries neither 'messages' nor 'prompt'")]
    MissingConversation,

    #[error("invalid field '{field}': expected {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
    },

    #[error("unknown role in messages[{index}]")]
    UnknownRole { index: usize },

    #[error("conversation must end with a user turn")]
    LastTurnNotUser,

    #[error("final user turn is empty")]
    EmptyUserTurn,
}

impl MalformedPayloadError {
    pub(crate) fn invalid(field: impl Into<String>, expected: &'static str) -> Self {
        Self::InvalidField {
            field: field.into(),
            expected,
        }
    }
}

/// Parse decrypted plaintext into a normalized request.
///
/// Accepts `{"messages": [...]}` or the legacy `{"prompt": "..."}`; when both
/// are present the conversation list wins. Missing sampling parameters take
/// the documented defaults.
pub fn parse(plaintext: &[u8]) -> Result<GenerationRequest, MalformedPayloadError> {
    let text = std::str::from_utf8(plaintext).map_err(|_| MalformedPayloadError::NotUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| MalformedPayloadError::InvalidJson {
            line: e.line(),
            column: e.column(),
        })?;
    let object = value.as_object().ok_or(MalformedPayloadError::NotAnObject)?;

    let conversation = match non_null(object, "messages") {
        Some(messages) => parse_messages(messages)?,
        None => Vec::new(),
    };
    let conversation = if conversation.is_empty() {
        match non_null(object, "prompt") {
            Some(Value::String(prompt)) => vec![Turn::user(prompt.clone())],
            Some(_) => return Err(MalformedPayloadError::invalid("prompt", "a string")),
            None => return Err(MalformedPayloadError::MissingConversation),
        }
    } else {
        conversation
    };

    let parameters = match non_null(object, "sampling_params") {
        Some(Value::Object(params)) => parse_params(params)?,
        Some(_) => return Err(MalformedPayloadError::invalid("sampling_params", "an object")),
        None => GenerationParams::default(),
    };

    Ok(GenerationRequest {
        conversation,
        parameters,
    })
}

fn non_null<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|v| !v.is_null())
}

fn parse_messages(value: &Value) -> Result<Vec<Turn>, MalformedPayloadError> {
    let items = value
        .as_array()
        .ok_or_else(|| MalformedPayloadError::invalid("messages", "an array"))?;

    let mut turns = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let role = item
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MalformedPayloadError::invalid(format!("messages[{index}].role"), "a string")
            })?;
        let role = Role::from_wire(role).ok_or(MalformedPayloadError::UnknownRole { index })?;
        let content = item
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MalformedPayloadError::invalid(format!("messages[{index}].content"), "a string")
            })?;
        turns.push(Turn::new(role, content));
    }
    Ok(turns)
}

fn parse_params(object: &Map<String, Value>) -> Result<GenerationParams, MalformedPayloadError> {
    let mut params = GenerationParams::default();

    if let Some(v) = non_null(object, "max_tokens") {
        params.max_tokens = v
            .as_u64()
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| MalformedPayloadError::invalid("max_tokens", "a positive integer"))?;
    }
    if let Some(v) = non_null(object, "temperature") {
        params.temperature = v
            .as_f64()
            .filter(|t| t.is_finite() && *t >= 0.0)
            .ok_or_else(|| MalformedPayloadError::invalid("temperature", "a number >= 0"))?
            as f32;
    }
    if let Some(v) = non_null(object, "top_p") {
        params.top_p = v
            .as_f64()
            .filter(|p| *p > 0.0 && *p <= 1.0)
            .ok_or_else(|| MalformedPayloadError::invalid("top_p", "a number in (0, 1]"))?
            as f32;
    }
    if let Some(v) = non_null(object, "stop") {
        let stop: Vec<&str> = match v {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items
                .iter()
                .map(Value::as_str)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| MalformedPayloadError::invalid("stop", "a string or list of strings"))?,
            _ => return Err(MalformedPayloadError::invalid("stop", "a string or list of strings")),
        };
        params = params.with_stop(stop);
    }

    Ok(params)
}

#[derive(Serialize)]
struct WirePayload<'a> {
    messages: &'a [Turn],
    sampling_params: WireSamplingParams<'a>,
}

#[derive(Serialize)]
struct WireSamplingParams<'a> {
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

/// Serialize a request in the conversation shape, for the client side.
pub fn serialize(request: &GenerationRequest) -> Result<Vec<u8>, serde_json::Error> {
    let payload = WirePayload {
        messages: &request.conversation,
        sampling_params: WireSamplingParams {
            max_tokens: request.parameters.max_tokens,
            temperature: request.parameters.temperature,
            top_p: request.parameters.top_p,
            stop: &request.parameters.stop,
        },
    };
    serde_json::to_vec(&payload)
}
