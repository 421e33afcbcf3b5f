//! Custom error types for the backup cycle.

use thiserror::Error;

/// Everything that can abort a backup cycle.
///
/// Every variant aborts the current cycle only; the folder layout on disk is
/// never advanced past a failed step, so the next scheduled invocation
/// re-derives a consistent state from the filesystem.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Another backup cycle is already running (pid {0})")]
    Locked(u32),

    #[error("Database rejected the configured credentials")]
    AuthRejected,

    #[error("No password prompt from the backup tool within {0} seconds")]
    PromptTimeout(u64),

    #[error("Backup tool failed: {0}")]
    Tool(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl CycleError {
    /// Stable identifier for the structured failure event.
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Config(_) => "config",
            CycleError::Io(_) => "io",
            CycleError::Locked(_) => "locked",
            CycleError::AuthRejected => "auth_rejected",
            CycleError::PromptTimeout(_) => "prompt_timeout",
            CycleError::Tool(_) => "tool",
            CycleError::Archive(_) => "archive",
        }
    }
}

pub type Result<T> = std::result::Result<T, CycleError>;
