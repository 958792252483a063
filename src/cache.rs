//! Cache root resolution.
//!
//! Precedence is `--cache-dir`, then `HF_HOME`, then the huggingface_hub
//! default (`$XDG_CACHE_HOME/huggingface` or `~/.cache/huggingface`). The
//! resolved [`CacheLocation`] is handed to the loader directly; the env export
//! only happens for an explicit directory.

use directories::BaseDirs;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const HF_HOME_VAR: &str = "HF_HOME";
pub const TRANSFORMERS_CACHE_VAR: &str = "TRANSFORMERS_CACHE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Explicit,
    Environment,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    root: PathBuf,
    source: CacheSource,
}

impl CacheLocation {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> CacheSource {
        self.source
    }

    /// Hub snapshot store, `<root>/hub`.
    pub fn hub_dir(&self) -> PathBuf {
        self.root.join("hub")
    }

    pub fn transformers_dir(&self) -> PathBuf {
        self.root.join("transformers")
    }

    /// Variables to export so that child tooling sees the same cache.
    ///
    /// Empty unless the location came from `--cache-dir`.
    pub fn env_vars(&self) -> Vec<(&'static str, PathBuf)> {
        match self.source {
            CacheSource::Explicit => vec![
                (HF_HOME_VAR, self.root.clone()),
                (TRANSFORMERS_CACHE_VAR, self.transformers_dir()),
            ],
            CacheSource::Environment | CacheSource::Default => Vec::new(),
        }
    }

    /// Write [`Self::env_vars`] into the process environment.
    ///
    /// Must run before any thread is spawned and before the model loads.
    pub fn export_env(&self) {
        for (key, value) in self.env_vars() {
            // SAFETY: invoked once from `main` while the process is still single-threaded.
            unsafe { std::env::set_var(key, &value) };
            tracing::debug!(key, value = %value.display(), "exported cache variable");
        }
    }

    /// Best-effort check for a previously downloaded repository whose cache
    /// directory name mentions `model_name`.
    pub fn contains_model(&self, model_name: &str) -> bool {
        let Ok(entries) = fs::read_dir(self.hub_dir()) else {
            return false;
        };
        entries.flatten().any(|entry| {
            entry.path().is_dir() && entry.file_name().to_string_lossy().contains(model_name)
        })
    }
}

impl fmt::Display for CacheLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            CacheSource::Explicit => {
                writeln!(f, "Using custom cache directory: {}", self.root.display())?;
                write!(f, "Transformers cache: {}", self.transformers_dir().display())
            }
            CacheSource::Environment => {
                write!(f, "Using HF_HOME from environment: {}", self.root.display())
            }
            CacheSource::Default => {
                write!(f, "Using default cache directory: {}", self.root.display())
            }
        }
    }
}

pub fn resolve(
    explicit: Option<&Path>,
    env_hf_home: Option<OsString>,
    default_root: PathBuf,
) -> CacheLocation {
    if let Some(dir) = explicit {
        return CacheLocation {
            root: dir.to_path_buf(),
            source: CacheSource::Explicit,
        };
    }
    if let Some(home) = env_hf_home.filter(|v| !v.is_empty()) {
        return CacheLocation {
            root: PathBuf::from(home),
            source: CacheSource::Environment,
        };
    }
    CacheLocation {
        root: default_root,
        source: CacheSource::Default,
    }
}

/// Resolve against the live process environment.
pub fn resolve_from_env(explicit: Option<&Path>) -> CacheLocation {
    let default_root = default_cache_root(
        std::env::var_os("XDG_CACHE_HOME"),
        BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()),
    );
    resolve(explicit, std::env::var_os(HF_HOME_VAR), default_root)
}

pub fn default_cache_root(xdg_cache_home: Option<OsString>, home: Option<PathBuf>) -> PathBuf {
    if let Some(xdg) = xdg_cache_home.filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("huggingface");
    }
    home.unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("huggingface")
}
