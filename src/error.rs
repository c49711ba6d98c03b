//! Error types for the launcher

use crate::process::ProcessSlot;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("No such process slot: {0}")]
    UnknownSlot(String),

    #[error("Process slot {0} is already running")]
    AlreadyRunning(ProcessSlot),

    #[error("Process slot {0} is not running")]
    NotRunning(ProcessSlot),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process slot {slot} did not exit within {timeout:?}")]
    ExitTimeout { slot: ProcessSlot, timeout: Duration },

    #[error("Invalid skin name (use alphanumeric, dash, underscore): {0}")]
    InvalidSkinName(String),

    #[error("Invalid config at {path:?}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("Failed to encode stats: {0}")]
    Stats(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LauncherError>;
