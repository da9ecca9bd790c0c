use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::save::SaveStage;

/// Synchronous failures reported by [`crate::Buffer`] operations.
///
/// Mutations attempted while modification is disallowed are not errors: they
/// return `Ok(false)` and leave the buffer untouched.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("position {index} is outside the buffer (size {size})")]
    OutOfRange { index: u64, size: u64 },

    #[error("file operations are not allowed on this buffer right now")]
    FileOperationsDisallowed,

    #[error("action chaining is already active")]
    ChainingActive,

    #[error("action chaining is not active")]
    ChainingInactive,

    #[error("buffer is not associated with a file")]
    NoFile,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures observed through the completion of an asynchronous save.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("not enough free space in {}: {needed} bytes needed, {available} available", .path.display())]
    InsufficientDiskSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("saving {} failed at stage {stage:?}: {source}", .path.display())]
    Io {
        path: PathBuf,
        stage: SaveStage,
        #[source]
        source: io::Error,
    },

    #[error("saved file {} could not be reopened: {source}", .path.display())]
    Reopen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("save worker panicked: {0}")]
    Panicked(String),
}

impl SaveError {
    /// The stage reached when the failure happened, if the failure was an I/O fault.
    pub fn stage(&self) -> Option<SaveStage> {
        match self {
            SaveError::Io { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T, E = BufferError> = std::result::Result<T, E>;
