// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when parsing JSONL session files.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Session file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied reading file: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Empty session file: {path}")]
    EmptyFile { path: PathBuf },

    #[error("Session file {path} has no header entry")]
    MissingHeader { path: PathBuf },
}

impl ParseError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {message}")]
    InvalidYaml { path: PathBuf, message: String },

    #[error("Invalid config value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron expression for {key}: {expression}")]
    InvalidCron { key: String, expression: String },

    #[error("Ambiguous encoded project directory: {encoded}")]
    AmbiguousProjectDir { encoded: String },

    #[error("Home directory not found")]
    HomeDirNotFound,
}

/// Errors from validating an analyzer response payload against the node schema.
#[derive(Debug, Error)]
pub enum NodeValidationError {
    #[error("Analyzer response contained no JSON object")]
    NoJsonFound,

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },
}
