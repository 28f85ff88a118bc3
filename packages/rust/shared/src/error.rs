//! Error types for DocGraph.
//!
//! Library crates use [`DocGraphError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all DocGraph operations.
#[derive(Debug, thiserror::Error)]
pub enum DocGraphError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A stage depends on a table nobody registered.
    #[error("table '{table}' is not registered")]
    UnregisteredTable { table: String },

    /// A `MERGE_WITH` chain loops back on itself.
    #[error("cyclic merge chain in cluster {cluster_id}: {}", chain.join(" -> "))]
    CyclicMergeChain { cluster_id: i64, chain: Vec<String> },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// External model or embedding call failed (bridge, protocol, or response parsing).
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Input parsing error (JSON lines, decision payloads).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid row shape, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocGraphError>;

impl DocGraphError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an unregistered-table error.
    pub fn unregistered(table: impl Into<String>) -> Self {
        Self::UnregisteredTable {
            table: table.into(),
        }
    }

    /// Configuration errors that must not be retried by the orchestrator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::UnregisteredTable { .. } | Self::CyclicMergeChain { .. }
        )
    }
}
