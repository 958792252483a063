//! Error values returned across the loader and generator boundaries.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed building HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model config at {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("unsafe file path in model config: '{0}'")]
    UnsafePath(String),

    #[error(
        "repository ships custom operators ({0}) but remote code is not trusted for this load"
    )]
    UntrustedRemoteCode(String),

    #[error("onnx runtime error: {0}")]
    Runtime(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model returned no audio output")]
    MissingAudio,

    #[error("unexpected audio tensor shape {0:?}")]
    AudioShape(Vec<i64>),

    #[error("wav write failed for {}: {source}", path.display())]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
