//! Decrypted request envelope.
//!
//! The plaintext inside an encrypted blob is UTF-8 JSON carrying either a full
//! conversation or a legacy single prompt, plus optional sampling parameters.
//! Everything is normalized into [`GenerationRequest`] before it can reach an
//! engine.

mod parse;

pub use parse::{parse, serialize, MalformedPayloadError};

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.95;

/// Typed chat roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// Stop sequences, duplicates removed, first-seen order kept.
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            stop: Vec::new(),
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), MalformedPayloadError> {
        if self.max_tokens == 0 {
            return Err(MalformedPayloadError::invalid("max_tokens", "a positive integer"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(MalformedPayloadError::invalid("temperature", "a number >= 0"));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(MalformedPayloadError::invalid("top_p", "a number in (0, 1]"));
        }
        Ok(())
    }

    /// Replace the stop set, dropping duplicates and empty strings.
    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop.clear();
        for s in stop {
            let s = s.into();
            if !s.is_empty() && !self.stop.contains(&s) {
                self.stop.push(s);
            }
        }
        self
    }
}

/// A normalized request, ready for the engine once validated.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub conversation: Vec<Turn>,
    pub parameters: GenerationParams,
}

impl GenerationRequest {
    pub fn new(conversation: Vec<Turn>, parameters: GenerationParams) -> Self {
        Self {
            conversation,
            parameters,
        }
    }

    /// Check the engine-entry invariant: a non-empty conversation ending
    /// with a user turn that has content.
    pub fn validate(&self) -> Result<(), MalformedPayloadError> {
        let last = self
            .conversation
            .last()
            .ok_or(MalformedPayloadError::MissingConversation)?;
        if last.role != Role::User {
            return Err(MalformedPayloadError::LastTurnNotUser);
        }
        if last.content.is_empty() {
            return Err(MalformedPayloadError::EmptyUserTurn);
        }
        self.parameters.validate()
    }

    /// Total content bytes across all turns.
    pub fn content_bytes(&self) -> usize {
        self.conversation.iter().map(|t| t.content.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let p = GenerationParams::default();
        assert_eq!(p.max_tokens, 512);
        assert!((p.temperature - 0.7).abs() < f32::EPSILON);
        assert!((p.top_p - 0.95).abs() < f32::EPSILON);
        assert!(p.stop.is_empty());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_params_validation() {
        let zero = GenerationParams { max_tokens: 0, ..Default::default() };
        assert!(zero.validate().is_err());

        let cold = GenerationParams { temperature: -0.1, ..Default::default() };
        assert!(cold.validate().is_err());

        let greedy = GenerationParams { temperature: 0.0, ..Default::default() };
        assert!(greedy.validate().is_ok());

        let no_mass = GenerationParams { top_p: 0.0, ..Default::default() };
        assert!(no_mass.validate().is_err());

        let full = GenerationParams { top_p: 1.0, ..Default::default() };
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_stop_is_a_set() {
        let p = GenerationParams::default().with_stop(["</s>", "", "\n\n", "</s>"]);
        assert_eq!(p.stop, vec!["</s>".to_string(), "\n\n".to_string()]);
    }

    #[test]
    fn test_last_turn_must_be_user() {
        let req = GenerationRequest::new(
            vec![Turn::user("hi"), Turn::assistant("hello")],
            GenerationParams::default(),
        );
        assert_eq!(req.validate(), Err(MalformedPayloadError::LastTurnNotUser));

        let empty = GenerationRequest::new(Vec::new(), GenerationParams::default());
        assert_eq!(empty.validate(), Err(MalformedPayloadError::MissingConversation));
    }
}
