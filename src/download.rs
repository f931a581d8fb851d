//! Resolve checkpoint locations, fetching `hf://` paths from HuggingFace Hub.
//!
//! Downloaded files are cached in `~/.cache/waveflow/`.

use anyhow::{Context, Result};
use hf_hub::api::sync::ApiBuilder;
use std::fs;
use std::path::{Path, PathBuf};

/// Create the cache directory if it doesn't exist.
///
/// Returns the path to `~/.cache/waveflow/`.
pub fn make_cache_directory() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    let cache_dir = Path::new(&home).join(".cache").join("waveflow");
    fs::create_dir_all(&cache_dir)?;
    Ok(cache_dir)
}

/// Download a file if it lives on the Hub, or return the local path unchanged.
///
/// Supported formats:
/// - `hf://owner/repo/path/to/file.safetensors`
/// - `hf://owner/repo/path/to/file.safetensors@revision`
/// - `/local/path/file.safetensors`
pub fn download_if_necessary(path: &str) -> Result<PathBuf> {
    if let Some(stripped) = path.strip_prefix("hf://") {
        let (repo_id, filename, revision) = parse_hf_path(stripped)?;
        let api = ApiBuilder::new()
            .with_cache_dir(make_cache_directory()?)
            .build()?;
        let repo = match revision {
            Some(rev) => api.repo(hf_hub::Repo::with_revision(
                repo_id,
                hf_hub::RepoType::Model,
                rev,
            )),
            None => api.repo(hf_hub::Repo::model(repo_id)),
        };
        tracing::info!(file = %filename, "fetching checkpoint from the hub");
        let cached = repo
            .get(&filename)
            .with_context(|| format!("failed to download {path}"))?;
        return Ok(cached);
    }

    let local = PathBuf::from(path);
    if !local.exists() {
        anyhow::bail!("No such file or directory: {path}");
    }
    Ok(local)
}

/// Parse `owner/repo/path@rev` into components for HuggingFace downloads.
fn parse_hf_path(path: &str) -> Result<(String, String, Option<String>)> {
    let mut parts = path.split('/').collect::<Vec<_>>();
    if parts.len() < 3 {
        anyhow::bail!("Invalid hf:// path: {path}");
    }
    let repo_id = format!("{}/{}", parts.remove(0), parts.remove(0));
    let filename = parts.join("/");

    if let Some((file, rev)) = filename.split_once('@') {
        return Ok((repo_id, file.to_string(), Some(rev.to_string())));
    }

    Ok((repo_id, filename, None))
}

#[cfg(test)]
mod tests {
    use super::{download_if_necessary, parse_hf_path};

    #[test]
    fn download_rejects_invalid_hf_path() {
        let err = download_if_necessary("hf://too-short").unwrap_err();
        assert!(err.to_string().contains("Invalid hf:// path"));
    }

    #[test]
    fn download_accepts_existing_local_path() {
        let path = download_if_necessary("Cargo.toml").unwrap();
        assert!(path.ends_with("Cargo.toml"));
    }

    #[test]
    fn download_rejects_missing_local_path() {
        let err = download_if_necessary("tests/missing_checkpoint.safetensors").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("no such file"));
    }

    #[test]
    fn hf_path_splits_repo_file_and_revision() {
        let (repo, file, rev) =
            parse_hf_path("acme/waveflow/ckpt/model.safetensors@v2").expect("parse");
        assert_eq!(repo, "acme/waveflow");
        assert_eq!(file, "ckpt/model.safetensors");
        assert_eq!(rev.as_deref(), Some("v2"));
    }
}
