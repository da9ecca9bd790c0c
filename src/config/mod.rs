use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Default size of the BackingStore read window and of save I/O blocks (64KB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// What happens to undo/redo history when a save replaces the backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepUndoPolicy {
    /// Drop both histories on every save
    Never,
    /// Copy everything the histories reference into memory
    Always,
    /// Copy while free memory allows, drop the rest
    #[default]
    WhileMemoryAvailable,
}

/// Buffer tuning, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of undo steps; `None` keeps everything
    pub max_undo_actions: Option<usize>,
    /// Where save-via-temp-file stages its output; `None` uses the system temp dir
    pub temp_dir: Option<PathBuf>,
    pub keep_undo_after_save: KeepUndoPolicy,
    /// Bytes mapped at once by the BackingStore window
    pub window_size: usize,
    /// Bytes written per I/O unit while saving (cancellation is checked between units)
    pub save_block_size: usize,
    /// Treat opened files as non-resizable, the way device files always are
    pub fixed_size: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_undo_actions: None,
            temp_dir: None,
            keep_undo_after_save: KeepUndoPolicy::default(),
            window_size: DEFAULT_BLOCK_SIZE,
            save_block_size: DEFAULT_BLOCK_SIZE,
            fixed_size: false,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(text)?;
        // zero-sized windows or blocks would never make progress
        config.window_size = config.window_size.max(1);
        config.save_block_size = config.save_block_size.max(1);
        Ok(config)
    }

    /// Resolved temp directory for staged saves
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json_str(r#"{"max_undo_actions": 2}"#).unwrap();

        assert_eq!(config.max_undo_actions, Some(2));
        assert_eq!(config.keep_undo_after_save, KeepUndoPolicy::WhileMemoryAvailable);
        assert_eq!(config.save_block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_policy_names() {
        let config = Config::from_json_str(
            r#"{"keep_undo_after_save": "never", "temp_dir": "/var/tmp", "window_size": 0}"#,
        )
        .unwrap();

        assert_eq!(config.keep_undo_after_save, KeepUndoPolicy::Never);
        assert_eq!(config.temp_dir(), PathBuf::from("/var/tmp"));
        assert_eq!(config.window_size, 1);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Config::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
