//! Model resolution.
//!
//! Maps configured model identifiers to local paths, downloading from the
//! model registry only when nothing is cached.

mod identifier;
mod resolver;

use std::path::PathBuf;

use thiserror::Error;

pub use identifier::{FileSelector, ModelIdentifier};
pub use resolver::{ModelResolver, IGNORED_SUFFIXES};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("invalid model identifier '{0}' (expected owner/name[:file-or-quant])")]
    InvalidIdentifier(String),

    #[error("no models configured")]
    NoModels,

    #[error("no file in {repo} matches '{selector}'")]
    NoMatchingFile { repo: String, selector: String },

    #[error("model registry error for {repo}: {message}")]
    Registry { repo: String, message: String },

    #[error("resolved path {0} does not exist")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resolver task failed: {0}")]
    Task(String),
}
