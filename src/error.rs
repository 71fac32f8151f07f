//! Error types for Tether

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Tether operations
///
/// File-level failures (`TransientIo`) never escalate past the sync engine;
/// they are recorded as `Failed` outcomes. Only configuration and watcher
/// subscription failures surface from the session controller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Copy failed for {path}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup destination unavailable: {path} ({reason})")]
    DestinationUnavailable { path: PathBuf, reason: String },

    #[error("Watcher subscription failed: {0}")]
    WatcherSubscription(#[from] notify::Error),

    #[error("Config parsing error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Invalid session state: {reason}")]
    InvalidState { reason: String },
}

impl Error {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether this error ends the current watching session
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::WatcherSubscription(_)
        )
    }
}

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, Error>;
