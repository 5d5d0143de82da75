//! Job wire types.

use serde::{Deserialize, Serialize};

use crate::security::EncryptedBlob;

/// A job as delivered by the host: `{"id": ..., "input": {"encrypted_input": ...}}`.
///
/// Every field is optional on the wire; absence is reported in-band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JobInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_input: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, blob: EncryptedBlob) -> Self {
        Self {
            id: Some(id.into()),
            input: Some(JobInput {
                encrypted_input: Some(blob.into_string()),
            }),
        }
    }

    /// The encrypted payload, if present and non-empty.
    pub fn encrypted_input(&self) -> Option<&str> {
        self.input
            .as_ref()
            .and_then(|i| i.encrypted_input.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// Job id, or a fresh one when the host sent none.
    pub fn id_or_generate(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_job() {
        let job: Job =
            serde_json::from_str(r#"{"id":"j1","input":{"encrypted_input":"abc"}}"#).unwrap();
        assert_eq!(job.id.as_deref(), Some("j1"));
        assert_eq!(job.encrypted_input(), Some("abc"));
    }

    #[test]
    fn test_missing_and_empty_input() {
        for raw in [
            r#"{}"#,
            r#"{"input":{}}"#,
            r#"{"input":{"encrypted_input":""}}"#,
            r#"{"input":{"encrypted_input":null}}"#,
        ] {
            let job: Job = serde_json::from_str(raw).unwrap();
            assert_eq!(job.encrypted_input(), None, "{raw}");
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let job: Job =
            serde_json::from_str(r#"{"input":{"encrypted_input":"x","prompt":"y"},"webhook":1}"#)
                .unwrap();
        assert_eq!(job.encrypted_input(), Some("x"));
    }

    #[test]
    fn test_generated_id() {
        let a = Job::default().id_or_generate();
        let b = Job::default().id_or_generate();
        assert_ne!(a, b);
    }
}
