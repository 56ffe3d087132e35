use std::io;

/// Custom error type for slash_deploy operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Audit sink error: {0}")]
    AuditError(String),

    #[error("Reply delivery failed: {0}")]
    ReplyFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Helper type for Results that use DispatchError
pub type Result<T> = std::result::Result<T, DispatchError>;
