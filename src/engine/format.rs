//! Chat prompt formats.
//!
//! When an engine has no usable template of its own, the conversation is
//! rendered with one of these formats. The format is either configured
//! explicitly or derived from the model file name.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::envelope::{Role, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    ChatMl,
    Llama3,
    Mistral,
    Gemma,
    Phi3,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown chat format '{0}' (expected auto, chatml, llama3, mistral, gemma or phi3)")]
pub struct UnknownFormat(pub String);

impl FormatTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::ChatMl => "chatml",
            FormatTag::Llama3 => "llama3",
            FormatTag::Mistral => "mistral",
            FormatTag::Gemma => "gemma",
            FormatTag::Phi3 => "phi3",
        }
    }

    /// Parse a configured format. `auto` (or empty) means no override.
    pub fn parse_setting(value: &str) -> Result<Option<FormatTag>, UnknownFormat> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }

    /// Markers that end an assistant turn in this format.
    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            FormatTag::ChatMl => &["<|im_end|>"],
            FormatTag::Llama3 => &["<|eot_id|>"],
            FormatTag::Mistral => &["</s>", "[INST]"],
            FormatTag::Gemma => &["<end_of_turn>"],
            FormatTag::Phi3 => &["<|end|>"],
        }
    }

    /// Render a conversation into a prompt that ends with an open assistant turn.
    ///
    /// The BOS token is left to the tokenizer.
    pub fn render(&self, conversation: &[Turn]) -> String {
        let mut out = String::new();
        match self {
            FormatTag::ChatMl => {
                for turn in conversation {
                    out.push_str("<|im_start|>");
                    out.push_str(turn.role.as_str());
                    out.push('\n');
                    out.push_str(&turn.content);
                    out.push_str("<|im_end|>\n");
                }
                out.push_str("<|im_start|>assistant\n");
            }
            FormatTag::Llama3 => {
                for turn in conversation {
                    out.push_str("<|start_header_id|>");
                    out.push_str(turn.role.as_str());
                    out.push_str("<|end_header_id|>\n\n");
                    out.push_str(turn.content.trim());
                    out.push_str("<|eot_id|>");
                }
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            }
            FormatTag::Phi3 => {
                for turn in conversation {
                    out.push_str("<|");
                    out.push_str(turn.role.as_str());
                    out.push_str("|>\n");
                    out.push_str(&turn.content);
                    out.push_str("<|end|>\n");
                }
                out.push_str("<|assistant|>\n");
            }
            FormatTag::Mistral => {
                for (system, turn) in fold_system(conversation) {
                    match turn.role {
                        Role::Assistant => {
                            out.push(' ');
                            out.push_str(turn.content.trim());
                            out.push_str("</s>");
                        }
                        _ => {
                            out.push_str("[INST] ");
                            if let Some(system) = system {
                                out.push_str(system.trim());
                                out.push_str("\n\n");
                            }
                            out.push_str(turn.content.trim());
                            out.push_str(" [/INST]");
                        }
                    }
                }
            }
            FormatTag::Gemma => {
                for (system, turn) in fold_system(conversation) {
                    let role = match turn.role {
                        Role::Assistant => "model",
                        _ => "user",
                    };
                    out.push_str("<start_of_turn>");
                    out.push_str(role);
                    out.push('\n');
                    if let Some(system) = system {
                        out.push_str(system.trim());
                        out.push_str("\n\n");
                    }
                    out.push_str(turn.content.trim());
                    out.push_str("<end_of_turn>\n");
                }
                out.push_str("<start_of_turn>model\n");
            }
        }
        out
    }
}

/// Formats without a system role fold system text into the next user turn.
fn fold_system(conversation: &[Turn]) -> Vec<(Option<String>, &Turn)> {
    let mut pending: Option<String> = None;
    let mut out = Vec::with_capacity(conversation.len());
    for turn in conversation {
        match turn.role {
            Role::System => {
                let merged = match pending.take() {
                    Some(prev) => format!("{prev}\n\n{}", turn.content),
                    None => turn.content.clone(),
                };
                pending = Some(merged);
            }
            Role::User => out.push((pending.take(), turn)),
            Role::Assistant => out.push((None, turn)),
        }
    }
    out
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatTag {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chatml" | "qwen" => Ok(FormatTag::ChatMl),
            "llama3" | "llama-3" => Ok(FormatTag::Llama3),
            "mistral" | "mistral-instruct" => Ok(FormatTag::Mistral),
            "gemma" => Ok(FormatTag::Gemma),
            "phi3" | "phi-3" => Ok(FormatTag::Phi3),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

/// Guess a prompt format from a model path or identifier.
///
/// `None` means the engine should use the template embedded in the model.
pub fn identifier_to_format_hint(identifier: impl AsRef<Path>) -> Option<FormatTag> {
    let path = identifier.as_ref();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let full = path.to_string_lossy().to_ascii_lowercase();

    // File name first; a repo directory named "qwen" should not override a
    // llama-3 file inside it.
    hint_from_name(&name).or_else(|| hint_from_name(&full))
}

fn hint_from_name(name: &str) -> Option<FormatTag> {
    const TABLE: &[(&str, FormatTag)] = &[
        ("llama-3", FormatTag::Llama3),
        ("llama3", FormatTag::Llama3),
        ("chatml", FormatTag::ChatMl),
        ("qwen", FormatTag::ChatMl),
        ("hermes", FormatTag::ChatMl),
        ("mistral", FormatTag::Mistral),
        ("mixtral", FormatTag::Mistral),
        ("gemma", FormatTag::Gemma),
        ("phi-3", FormatTag::Phi3),
        ("phi3", FormatTag::Phi3),
    ];
    if name.is_empty() {
        return None;
    }
    TABLE
        .iter()
        .find(|(needle, _)| name.contains(needle))
        .map(|(_, tag)| *tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convo() -> Vec<Turn> {
        vec![
            Turn::system("Be brief."),
            Turn::user("hi"),
            Turn::assistant("hello"),
            Turn::user("2+2="),
        ]
    }

    #[test]
    fn test_hint_from_file_names() {
        assert_eq!(
            identifier_to_format_hint("/models/Meta-Llama-3-8B-Instruct.Q4_K_M.gguf"),
            Some(FormatTag::Llama3)
        );
        assert_eq!(
            identifier_to_format_hint("qwen2.5-7b-instruct-q4_k_m.gguf"),
            Some(FormatTag::ChatMl)
        );
        assert_eq!(
            identifier_to_format_hint("mistral-7b-instruct-v0.2.Q5_K_M.gguf"),
            Some(FormatTag::Mistral)
        );
        assert_eq!(
            identifier_to_format_hint("gemma-2-9b-it.gguf"),
            Some(FormatTag::Gemma)
        );
        assert_eq!(
            identifier_to_format_hint("Phi-3-mini-4k-instruct-q4.gguf"),
            Some(FormatTag::Phi3)
        );
    }

    #[test]
    fn test_unknown_family_defers_to_engine() {
        assert_eq!(identifier_to_format_hint("/models/tinystories.gguf"), None);
        assert_eq!(identifier_to_format_hint(""), None);
    }

    #[test]
    fn test_file_name_wins_over_directory() {
        assert_eq!(
            identifier_to_format_hint("/cache/qwen-mirror/llama-3-8b.gguf"),
            Some(FormatTag::Llama3)
        );
    }

    #[test]
    fn test_parse_setting() {
        assert_eq!(FormatTag::parse_setting("auto").unwrap(), None);
        assert_eq!(FormatTag::parse_setting("  ").unwrap(), None);
        assert_eq!(
            FormatTag::parse_setting("ChatML").unwrap(),
            Some(FormatTag::ChatMl)
        );
        assert!(FormatTag::parse_setting("alpaca").is_err());
    }

    #[test]
    fn test_chatml_render() {
        let prompt = FormatTag::ChatMl.render(&convo());
        assert!(prompt.starts_with("<|im_start|>system\nBe brief.<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>user\n2+2=<|im_end|>\n<|im_start|>assistant\n"));
    }

    #[test]
    fn test_llama3_render() {
        let prompt = FormatTag::Llama3.render(&convo());
        assert!(prompt.starts_with("<|start_header_id|>system<|end_header_id|>\n\nBe brief.<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_mistral_folds_system_into_first_user_turn() {
        let prompt = FormatTag::Mistral.render(&convo());
        assert_eq!(
            prompt,
            "[INST] Be brief.\n\nhi [/INST] hello</s>[INST] 2+2= [/INST]"
        );
    }

    #[test]
    fn test_gemma_uses_model_role() {
        let prompt = FormatTag::Gemma.render(&convo());
        assert!(prompt.contains("<start_of_turn>model\nhello<end_of_turn>\n"));
        assert!(prompt.starts_with("<start_of_turn>user\nBe brief.\n\nhi<end_of_turn>\n"));
        assert!(prompt.ends_with("<start_of_turn>model\n"));
    }

    #[test]
    fn test_phi3_render() {
        let prompt = FormatTag::Phi3.render(&[Turn::user("hi")]);
        assert_eq!(prompt, "<|user|>\nhi<|end|>\n<|assistant|>\n");
    }
}
