use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("launch target not found: {}", .0.display())]
    LaunchTargetMissing(PathBuf),
    #[error("working directory not found: {}", .0.display())]
    WorkingDirMissing(PathBuf),
    #[error("unknown game: {0}")]
    UnknownGame(String),
    #[error("no launch script '{0}' for this platform")]
    UnknownScript(String),
    #[error("failed to spawn server process: {0}")]
    Spawn(String),
}

impl StartError {
    /// Precondition failures are the caller's fault and leave no trace beyond a system entry.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, StartError::Spawn(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error("server is not running")]
    NotRunning,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("server is not running")]
    NotRunning,
    #[error("command is required")]
    EmptyInput,
    #[error("failed to write to server input: {0}")]
    Io(String),
}
