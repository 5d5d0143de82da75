//! Offline model resolution against a prepared cache directory.

use std::fs;
use std::path::{Path, PathBuf};

use sealed_llm::models::{ModelResolver, ResolveError};
use tempfile::TempDir;

/// Lay out `models--owner--name` the way the registry cache does.
fn seed_cache(files: &[&str]) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("models--owner--name");
    let snapshot = repo.join("snapshots").join("abc123");
    fs::create_dir_all(&snapshot).unwrap();
    fs::create_dir_all(repo.join("refs")).unwrap();
    fs::write(repo.join("refs").join("main"), "abc123").unwrap();
    for file in files {
        fs::write(snapshot.join(file), b"GGUF").unwrap();
    }
    (dir, snapshot)
}

#[test]
fn test_quant_selector_resolves_from_cache() {
    let (dir, snapshot) = seed_cache(&["model.Q4_K_M.gguf", "model.Q8_0.gguf", "README.md"]);
    let resolver = ModelResolver::new(dir.path(), None);
    let path = resolver.resolve("owner/name:Q4_K_M").unwrap();
    assert_eq!(path, snapshot.join("model.Q4_K_M.gguf"));

    let path = resolver.resolve("owner/name:q8_0").unwrap();
    assert_eq!(path, snapshot.join("model.Q8_0.gguf"));
}

#[test]
fn test_file_selector_resolves_from_cache() {
    let (dir, snapshot) = seed_cache(&["model.Q4_K_M.gguf"]);
    let resolver = ModelResolver::new(dir.path(), None);
    let path = resolver.resolve("owner/name:model.Q4_K_M.gguf").unwrap();
    assert_eq!(path, snapshot.join("model.Q4_K_M.gguf"));
}

#[test]
fn test_bare_repo_prefers_a_gguf_file() {
    let (dir, snapshot) = seed_cache(&["config.json", "b.gguf", "a.gguf"]);
    let resolver = ModelResolver::new(dir.path(), None);
    assert_eq!(resolver.resolve("owner/name").unwrap(), snapshot.join("a.gguf"));
}

#[test]
fn test_local_path_passes_through() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("local.gguf");
    fs::write(&file, b"GGUF").unwrap();
    let resolver = ModelResolver::new("/nonexistent-cache", None);
    let identifier = file.to_string_lossy().to_string();
    assert_eq!(resolver.resolve(&identifier).unwrap(), file);
}

#[test]
fn test_prepare_returns_first_model() {
    let (dir, snapshot) = seed_cache(&["model.Q4_K_M.gguf"]);
    let resolver = ModelResolver::new(dir.path(), None);
    let other = dir.path().join("other.gguf");
    fs::write(&other, b"GGUF").unwrap();

    let models = vec![
        "owner/name:Q4_K_M".to_string(),
        other.to_string_lossy().to_string(),
    ];
    assert_eq!(resolver.prepare(&models).unwrap(), snapshot.join("model.Q4_K_M.gguf"));
}

#[tokio::test]
async fn test_prepare_async_matches_blocking() {
    let (dir, snapshot) = seed_cache(&["model.Q4_K_M.gguf"]);
    let resolver = ModelResolver::new(dir.path(), None);
    let path = resolver
        .prepare_async(vec!["owner/name:Q4_K_M".to_string()])
        .await
        .unwrap();
    assert_eq!(path, snapshot.join("model.Q4_K_M.gguf"));
    assert!(Path::new(&path).exists());
}

#[test]
fn test_malformed_identifier() {
    let resolver = ModelResolver::new("/nonexistent-cache", None);
    for bad in ["justaname", "owner/", "/name", "a/b/c", "owner/name:"] {
        assert!(
            matches!(resolver.resolve(bad), Err(ResolveError::InvalidIdentifier(_))),
            "{bad} should be rejected"
        );
    }
}
