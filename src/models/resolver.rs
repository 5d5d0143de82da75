//! Registry-backed model resolver on top of `hf-hub`.

use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Cache, Repo};
use tracing::{debug, info};

use super::{FileSelector, ModelIdentifier, ResolveError};

/// Repository files never downloaded as part of a snapshot.
pub const IGNORED_SUFFIXES: &[&str] = &[".msgpack", ".h5", ".ot", ".tflite"];

/// Resolves identifiers against a local cache directory, then the registry.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    cache_dir: PathBuf,
    token: Option<String>,
}

impl ModelResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, token: Option<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            token,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve every identifier and return the first path.
    ///
    /// Blocking; see [`ModelResolver::prepare_async`].
    pub fn prepare(&self, identifiers: &[String]) -> Result<PathBuf, ResolveError> {
        let mut first = None;
        for identifier in identifiers.iter().filter(|s| !s.trim().is_empty()) {
            let path = self.resolve(identifier)?;
            first.get_or_insert(path);
        }
        first.ok_or(ResolveError::NoModels)
    }

    pub async fn prepare_async(&self, identifiers: Vec<String>) -> Result<PathBuf, ResolveError> {
        let resolver = self.clone();
        tokio::task::spawn_blocking(move || resolver.prepare(&identifiers))
            .await
            .map_err(|e| ResolveError::Task(e.to_string()))?
    }

    /// Resolve one identifier to a local path. Blocking.
    pub fn resolve(&self, identifier: &str) -> Result<PathBuf, ResolveError> {
        let local = Path::new(identifier.trim());
        if local.exists() {
            debug!(path = %local.display(), "model is a local path");
            return Ok(local.to_path_buf());
        }

        let id = ModelIdentifier::parse(identifier)?;
        if let Some(path) = self.cached(&id) {
            info!(model = %id, path = %path.display(), "model found in cache");
            return Ok(path);
        }

        info!(model = %id, cache = %self.cache_dir.display(), "downloading model");
        let path = self.download(&id)?;
        if !path.exists() {
            return Err(ResolveError::NotFound(path));
        }
        info!(model = %id, path = %path.display(), "model downloaded");
        Ok(path)
    }

    fn cached(&self, id: &ModelIdentifier) -> Option<PathBuf> {
        match &id.selector {
            Some(FileSelector::File(name)) => Cache::new(self.cache_dir.clone())
                .repo(Repo::model(id.repo_id.clone()))
                .get(name),
            Some(FileSelector::Quant(tag)) => {
                let snapshot = self.snapshot_dir(&id.repo_id)?;
                let mut files = gguf_files(&snapshot);
                files.retain(|p| {
                    p.file_name()
                        .map(|n| ModelIdentifier::matches_quant(&n.to_string_lossy(), tag))
                        .unwrap_or(false)
                });
                files.into_iter().next()
            }
            None => {
                let snapshot = self.snapshot_dir(&id.repo_id)?;
                Some(gguf_files(&snapshot).into_iter().next().unwrap_or(snapshot))
            }
        }
    }

    /// `<cache>/models--owner--name/snapshots/<rev>` for the cached `main`
    /// revision, or the only snapshot present.
    fn snapshot_dir(&self, repo_id: &str) -> Option<PathBuf> {
        let repo_dir = self
            .cache_dir
            .join(Repo::model(repo_id.to_string()).folder_name());
        let snapshots = repo_dir.join("snapshots");

        if let Ok(rev) = fs::read_to_string(repo_dir.join("refs").join("main")) {
            let dir = snapshots.join(rev.trim());
            if dir.is_dir() {
                return Some(dir);
            }
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(&snapshots)
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        match dirs.len() {
            1 => dirs.pop(),
            _ => None,
        }
    }

    fn download(&self, id: &ModelIdentifier) -> Result<PathBuf, ResolveError> {
        let registry = |e: hf_hub::api::sync::ApiError| ResolveError::Registry {
            repo: id.repo_id.clone(),
            message: e.to_string(),
        };
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .with_token(self.token.clone())
            .with_progress(false)
            .build()
            .map_err(registry)?;
        let repo = api.model(id.repo_id.clone());

        match &id.selector {
            Some(FileSelector::File(name)) => repo.get(name).map_err(registry),
            Some(FileSelector::Quant(tag)) => {
                let mut names: Vec<String> = list_files(&repo)
                    .map_err(registry)?
                    .into_iter()
                    .filter(|n| ModelIdentifier::matches_quant(n, tag))
                    .collect();
                names.sort();
                let name = names.into_iter().next().ok_or_else(|| ResolveError::NoMatchingFile {
                    repo: id.repo_id.clone(),
                    selector: tag.clone(),
                })?;
                repo.get(&name).map_err(registry)
            }
            None => {
                let names: Vec<String> = list_files(&repo)
                    .map_err(registry)?
                    .into_iter()
                    .filter(|n| !is_ignored(n))
                    .collect();
                let mut snapshot = None;
                let mut gguf = None;
                for name in &names {
                    let path = repo.get(name).map_err(registry)?;
                    if snapshot.is_none() {
                        snapshot = snapshot_root(&path, name);
                    }
                    if gguf.is_none() && name.to_ascii_lowercase().ends_with(".gguf") {
                        gguf = Some(path);
                    }
                }
                gguf.or(snapshot).ok_or_else(|| ResolveError::NoMatchingFile {
                    repo: id.repo_id.clone(),
                    selector: "*".to_string(),
                })
            }
        }
    }
}

fn list_files(repo: &ApiRepo) -> Result<Vec<String>, hf_hub::api::sync::ApiError> {
    Ok(repo
        .info()?
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .collect())
}

fn is_ignored(name: &str) -> bool {
    IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Walk up from a downloaded file to its snapshot directory.
fn snapshot_root(path: &Path, rfilename: &str) -> Option<PathBuf> {
    let depth = Path::new(rfilename).components().count();
    path.ancestors().nth(depth).map(Path::to_path_buf)
}

/// Top-level `.gguf` files of a snapshot, sorted by name.
fn gguf_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}
