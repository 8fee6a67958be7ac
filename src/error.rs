use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

/// Fatal errors. Any of these aborts the run before a single file is matched.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Signature manifest not found: {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("Parse error in {location}: {message}")]
    ManifestParse { location: String, message: String },

    #[error("Circular extends: {}", .chain.join(" -> "))]
    CircularExtends { chain: Vec<String> },

    #[error("Unknown profile reference '{reference}' (from {referrer})")]
    UnknownProfile { reference: String, referrer: String },

    #[error("Invalid {kind} '{pattern}' in signature {signature_id}: {message}")]
    InvalidPattern {
        signature_id: String,
        kind: &'static str,
        pattern: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ScanError {
    pub fn exit_code(&self) -> i32 {
        2
    }
}
