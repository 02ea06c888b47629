//! Error types for the supplier mailer.

use std::path::PathBuf;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Address directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SMTP configuration is missing or invalid: {0}")]
    MissingSmtp(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address table errors. The loader folds these into an empty directory,
/// they never abort a run.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Address table not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read address table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outbound mail errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SMTP transport error: {0}")]
    Transport(String),

    #[error("SMTP send failed: {0}")]
    SendFailed(String),

    #[error("SMTP connection test failed: {0}")]
    ConnectionFailed(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
