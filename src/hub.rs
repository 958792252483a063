//! Repository file fetching into the hub cache layout.
//!
//! ```text
//! <root>/hub/models--<owner>--<name>/
//! ├── refs/<revision>          snapshot name for the revision
//! ├── snapshots/<snapshot>/    repository files
//! └── manifest.json            what this tool downloaded
//! ```

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub endpoint: String,
    pub token: Option<String>,
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("HF_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            token: std::env::var("HF_TOKEN").ok().filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheManifest {
    repo_id: String,
    revision: String,
    fetched_at_unix: u64,
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    name: String,
    bytes: u64,
    sha256: String,
}

/// A single repository revision inside the hub cache.
pub struct RepoSnapshot {
    client: Client,
    config: HubConfig,
    repo_id: String,
    revision: String,
    repo_dir: PathBuf,
    snapshot_dir: PathBuf,
    fetched: Vec<ManifestEntry>,
}

impl RepoSnapshot {
    pub fn open(hub_dir: &Path, repo_id: &str, revision: &str, config: HubConfig) -> Result<Self> {
        let repo_dir = hub_dir.join(repo_cache_name(repo_id));
        let snapshot_dir = snapshot_dir(&repo_dir, revision);
        Ok(Self {
            client: build_http_client()?,
            config,
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
            repo_dir,
            snapshot_dir,
            fetched: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Return the cached path of `file_name`, downloading it first if absent.
    pub fn fetch(&mut self, file_name: &str) -> Result<PathBuf> {
        let file_name = safe_file_name(file_name)?;
        let dest = self.snapshot_dir.join(file_name);
        if dest.exists() {
            tracing::debug!(file = file_name, "reusing cached file");
            return Ok(dest);
        }

        fs::create_dir_all(&self.snapshot_dir).map_err(|e| {
            Error::io(
                format!("failed creating cache dir {}", self.snapshot_dir.display()),
                e,
            )
        })?;
        let url = resolve_url(
            &self.config.endpoint,
            &self.repo_id,
            &self.revision,
            file_name,
        );
        println!("Downloading {file_name}...");
        let (bytes, sha256) =
            download_repo_file(&self.client, &url, self.config.token.as_deref(), &dest)?;
        self.fetched.push(ManifestEntry {
            name: file_name.to_string(),
            bytes,
            sha256,
        });
        Ok(dest)
    }

    /// Record the revision ref and manifest when anything new was downloaded.
    ///
    /// Entries from an earlier manifest survive unless re-fetched here.
    pub fn finish(self) -> Result<()> {
        if self.fetched.is_empty() {
            return Ok(());
        }

        let refs_dir = self.repo_dir.join("refs");
        let ref_path = refs_dir.join(&self.revision);
        if !ref_path.exists() {
            fs::create_dir_all(&refs_dir).map_err(|e| {
                Error::io(format!("failed creating {}", refs_dir.display()), e)
            })?;
            let snapshot_name = self
                .snapshot_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| self.revision.clone());
            fs::write(&ref_path, snapshot_name)
                .map_err(|e| Error::io(format!("failed writing {}", ref_path.display()), e))?;
        }

        let manifest_path = self.repo_dir.join("manifest.json");
        let mut files = read_manifest(&manifest_path)
            .map(|previous| previous.files)
            .unwrap_or_default();
        files.retain(|old| !self.fetched.iter().any(|new| new.name == old.name));
        files.extend(self.fetched);

        let manifest = CacheManifest {
            repo_id: self.repo_id,
            revision: self.revision,
            fetched_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            files,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::io("failed encoding manifest", e.into()))?;
        fs::write(&manifest_path, manifest_json).map_err(|e| {
            Error::io(
                format!("failed writing manifest at {}", manifest_path.display()),
                e,
            )
        })
    }
}

fn read_manifest(path: &Path) -> Option<CacheManifest> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable manifest");
            None
        }
    }
}

/// `owner/name` -> `models--owner--name`.
pub fn repo_cache_name(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}

/// Resolve a revision to its snapshot directory, following `refs/<revision>`
/// when present so commit-hash snapshots from other tooling are reused.
pub fn snapshot_dir(repo_dir: &Path, revision: &str) -> PathBuf {
    let snapshots = repo_dir.join("snapshots");
    match fs::read_to_string(repo_dir.join("refs").join(revision)) {
        Ok(raw) if !raw.trim().is_empty() => snapshots.join(raw.trim()),
        _ => snapshots.join(revision),
    }
}

pub fn resolve_url(endpoint: &str, repo_id: &str, revision: &str, file_name: &str) -> String {
    format!(
        "{}/{repo_id}/resolve/{revision}/{file_name}?download=true",
        endpoint.trim_end_matches('/')
    )
}

pub fn safe_file_name(value: &str) -> Result<&str> {
    let path = Path::new(value);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(Error::UnsafePath(value.to_string())),
        }
    }

    if value.is_empty() || value.contains('/') || value.contains('\\') {
        return Err(Error::UnsafePath(value.to_string()));
    }
    Ok(value)
}

/// Client with a bounded connect phase and no overall transfer timeout.
fn build_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("vibevoice-tts-rs/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(None)
        .build()
        .map_err(Error::HttpClient)
}

/// Stream `url` into `dest` through a temp file; returns `(bytes, sha256)`.
fn download_repo_file(
    client: &Client,
    url: &str,
    token: Option<&str>,
    dest: &Path,
) -> Result<(u64, String)> {
    let temp_path = dest.with_extension("download.tmp");
    let result = (|| -> Result<(u64, String)> {
        let mut request = client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|source| Error::Download {
                url: url.to_string(),
                source,
            })?;

        let file = File::create(&temp_path).map_err(|e| {
            Error::io(
                format!("failed creating temp file {}", temp_path.display()),
                e,
            )
        })?;
        let mut writer = HashingWriter::new(file);
        let bytes = io::copy(&mut response, &mut writer).map_err(|e| {
            Error::io(
                format!("failed writing to temp file {}", temp_path.display()),
                e,
            )
        })?;
        let (mut file, digest) = writer.finish();
        file.flush()
            .map_err(|e| Error::io(format!("failed flushing {}", temp_path.display()), e))?;

        fs::rename(&temp_path, dest).map_err(|e| {
            Error::io(
                format!(
                    "failed moving temp file {} to {}",
                    temp_path.display(),
                    dest.display()
                ),
                e,
            )
        })?;

        Ok((bytes, digest))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Writer adapter that hashes everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_cache_name_follows_hub_convention() {
        assert_eq!(
            repo_cache_name("FabioSarracino/VibeVoice-Large-Q8"),
            "models--FabioSarracino--VibeVoice-Large-Q8"
        );
    }

    #[test]
    fn snapshot_dir_defaults_to_revision_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            snapshot_dir(dir.path(), "main"),
            dir.path().join("snapshots").join("main")
        );
    }

    #[test]
    fn snapshot_dir_follows_refs() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("refs")).expect("refs dir");
        fs::write(dir.path().join("refs").join("main"), "3f2a9c1\n").expect("write ref");
        assert_eq!(
            snapshot_dir(dir.path(), "main"),
            dir.path().join("snapshots").join("3f2a9c1")
        );
    }

    #[test]
    fn resolve_url_trims_endpoint_slash() {
        assert_eq!(
            resolve_url("https://hf-mirror.com/", "a/b", "main", "config.json"),
            "https://hf-mirror.com/a/b/resolve/main/config.json?download=true"
        );
    }

    #[test]
    fn safe_file_name_rejects_nested_and_parent_paths() {
        assert_eq!(safe_file_name("model.onnx").expect("plain name"), "model.onnx");
        assert!(safe_file_name("../secret").is_err());
        assert!(safe_file_name("sub/model.onnx").is_err());
        assert!(safe_file_name("/etc/passwd").is_err());
        assert!(safe_file_name("").is_err());
    }

    #[test]
    fn fetch_reuses_cached_file_without_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo_dir = dir.path().join(repo_cache_name("owner/model"));
        let snap = repo_dir.join("snapshots").join("main");
        fs::create_dir_all(&snap).expect("snapshot dir");
        fs::write(snap.join("config.json"), "{}").expect("write config");

        let config = HubConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            token: None,
        };
        let mut snapshot =
            RepoSnapshot::open(dir.path(), "owner/model", "main", config).expect("open");
        let path = snapshot.fetch("config.json").expect("cached fetch");
        assert_eq!(path, snap.join("config.json"));
        snapshot.finish().expect("finish");
        assert!(!repo_dir.join("manifest.json").exists());
    }

    #[test]
    fn finish_merges_with_existing_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo_dir = dir.path().join(repo_cache_name("owner/model"));
        fs::create_dir_all(&repo_dir).expect("repo dir");
        let previous = r#"{
            "repo_id": "owner/model",
            "revision": "main",
            "fetched_at_unix": 1,
            "files": [
                { "name": "config.json", "bytes": 2, "sha256": "old-config" },
                { "name": "model.onnx", "bytes": 10, "sha256": "old-model" }
            ]
        }"#;
        fs::write(repo_dir.join("manifest.json"), previous).expect("write manifest");

        let config = HubConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            token: None,
        };
        let mut snapshot =
            RepoSnapshot::open(dir.path(), "owner/model", "main", config).expect("open");
        snapshot.fetched.push(ManifestEntry {
            name: "model.onnx".to_string(),
            bytes: 12,
            sha256: "new-model".to_string(),
        });
        snapshot.fetched.push(ManifestEntry {
            name: "tokenizer.json".to_string(),
            bytes: 5,
            sha256: "new-tokenizer".to_string(),
        });
        snapshot.finish().expect("finish");

        let merged = read_manifest(&repo_dir.join("manifest.json")).expect("manifest");
        let digests: Vec<(&str, &str)> = merged
            .files
            .iter()
            .map(|f| (f.name.as_str(), f.sha256.as_str()))
            .collect();
        assert_eq!(
            digests,
            vec![
                ("config.json", "old-config"),
                ("model.onnx", "new-model"),
                ("tokenizer.json", "new-tokenizer"),
            ]
        );
        assert_eq!(
            fs::read_to_string(repo_dir.join("refs").join("main")).expect("ref"),
            "main"
        );
    }

    #[test]
    fn hashing_writer_reports_sha256() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"abc").expect("write");
        let (bytes, digest) = writer.finish();
        assert_eq!(bytes, b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
