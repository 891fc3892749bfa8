//! Unified error type for the mirror
//!
//! One variant per failure kind the storage and sync layers distinguish.
//! Whether a kind aborts its owning operation is decided by
//! [`MirrorError::is_fatal`]; everything else is logged and degraded around.

use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MirrorError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("No provider available for mailbox: {0}")]
    NoProviderAvailable(String),

    #[error("Thread data error: {0}")]
    ThreadData(String),

    #[error("Date normalization error: {0}")]
    DateNormalization(String),

    #[error("Thread list error: {0}")]
    ThreadList(String),

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Label retrieval error: {0}")]
    LabelRetrieval(String),

    #[error("Label creation error: {0}")]
    LabelCreation(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MirrorError {
    /// Fatal kinds abort the operation that raised them. The rest are
    /// side effects the caller is expected to log and work around.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MirrorError::ConnectionNotFound(_)
                | MirrorError::Registry(_)
                | MirrorError::Timeout(_)
                | MirrorError::ThreadList(_)
                | MirrorError::Concurrency(_)
        )
    }
}

// Serialize as a plain string so API callers get the display message.
impl Serialize for MirrorError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<r2d2::Error> for MirrorError {
    fn from(e: r2d2::Error) -> Self {
        MirrorError::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for MirrorError {
    fn from(e: rusqlite::Error) -> Self {
        MirrorError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        MirrorError::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(e: toml::de::Error) -> Self {
        MirrorError::Config(e.to_string())
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(e: std::io::Error) -> Self {
        MirrorError::Io(e.to_string())
    }
}

/// Result type alias using MirrorError
pub type Result<T> = std::result::Result<T, MirrorError>;
