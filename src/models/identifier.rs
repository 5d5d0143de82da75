//! Model identifiers: `owner/name[:selector]`.

use std::fmt;

use super::ResolveError;

/// Which file(s) of a repository to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSelector {
    /// One exact file, e.g. `model.Q4_K_M.gguf`.
    File(String),
    /// A quantization tag matched against `.gguf` file names, e.g. `Q4_K_M`.
    Quant(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIdentifier {
    pub repo_id: String,
    /// `None` means the whole repository snapshot.
    pub selector: Option<FileSelector>,
}

impl ModelIdentifier {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let raw = raw.trim();
        let invalid = || ResolveError::InvalidIdentifier(raw.to_string());

        let (repo_id, selector) = match raw.split_once(':') {
            Some((repo, sel)) => (repo.trim(), Some(sel.trim())),
            None => (raw, None),
        };
        let (owner, name) = repo_id.split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }

        let selector = match selector {
            None => None,
            Some("") => return Err(invalid()),
            Some(sel) if sel.contains('.') => Some(FileSelector::File(sel.to_string())),
            Some(sel) => Some(FileSelector::Quant(sel.to_string())),
        };
        Ok(Self {
            repo_id: repo_id.to_string(),
            selector,
        })
    }

    /// Does a repository file satisfy this identifier's quant selector?
    pub(crate) fn matches_quant(file_name: &str, tag: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        lower.ends_with(".gguf") && lower.contains(&tag.to_ascii_lowercase())
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            None => write!(f, "{}", self.repo_id),
            Some(FileSelector::File(file)) => write!(f, "{}:{file}", self.repo_id),
            Some(FileSelector::Quant(tag)) => write!(f, "{}:{tag}", self.repo_id),
        }
    }
}
