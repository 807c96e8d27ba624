//! Core error types for oms

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type shared by the oms crates
#[derive(Error, Debug)]
pub enum OmsError {
    /// Inventory store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Model validation error
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inventory store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Row not found
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Unique constraint or similar conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Rejected input
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Column carried malformed JSON
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database file or directory could not be prepared
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad pattern passed to a regex lookup
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl StoreError {
    /// Shorthand for a missing row keyed by id
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound {
            entity,
            key: id.to_string(),
        }
    }

    /// Whether this error means the row does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// YAML parse or serialize error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Database driver this build cannot open
    #[error("Unsupported database driver: {0}")]
    UnsupportedDriver(String),
}

/// Field-level validation failures for inventory records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("port must be in 1..=65535, got {0}")]
    Port(i64),

    #[error("address is neither an IP nor a DNS name: {0:?}")]
    Address(String),

    #[error("exactly one of password or private_key_id is required")]
    Credential,

    #[error("expected host:port, got {0:?}")]
    Endpoint(String),

    #[error("unknown {field} value {value:?}")]
    Enum { field: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}
