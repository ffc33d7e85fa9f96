use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("failed to read whitelist {path}: {source}")]
    Whitelist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open input {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: failed to decode record: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: failed to encode record: {source}")]
    Encode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid git remote {url:?}: {source}")]
    GitUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid recall actions {raw:?}: {reason}")]
    RecallActions { raw: String, reason: String },
}
