//! XtraBackup Automator Library
//!
//! Decides per invocation between a base backup, an incremental backup, or
//! seal-then-base; supervises the interactive XtraBackup command; and
//! rotates sealed archives under a retention policy. The folder layout on
//! disk is the only durable state.

pub mod archive;
pub mod config;
pub mod engine;
pub mod inspector;
pub mod lockfile;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::{CycleDecision, CycleOutcome};
pub use utils::errors::CycleError;
pub type Result<T> = std::result::Result<T, CycleError>;
