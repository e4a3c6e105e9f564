//! Crate-wide error types.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Most failure modes in the capture core are absorbed into state
/// transitions or retries; the variants here are the ones that must
/// surface to a caller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The destination file already exists. This is a filename-collision
    /// invariant violation upstream, not a recoverable condition.
    #[error("Destination already exists: {}", path.display())]
    FileExists { path: PathBuf },

    /// `ProcessSupervisor::start` was called while a previous encoder
    /// process had not yet been observed to exit.
    #[error("Capture process already running for room {room_id}")]
    CaptureActive { room_id: String },

    /// A second live task was requested for a room that already has one.
    #[error("Room {room_id} is already being tracked")]
    DuplicateTask { room_id: String },

    #[error("Room not found: {room_id}")]
    RoomNotFound { room_id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
