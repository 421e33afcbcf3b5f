//! Configuration management for the backup automator.
//!
//! Loads configuration from a TOML file, falling back to built-in defaults
//! when no file is given. The configuration is an immutable value for the
//! duration of one cycle.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::archive::ArchiveFormat;
use crate::utils::errors::{CycleError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub naming: NamingConfig,
    pub general: GeneralConfig,
    pub archive: ArchiveConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// MySQL user the backup tool connects as
    pub user: String,

    /// Password supplied on the tool's interactive prompt (never on argv)
    pub password: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory for all backup related state
    pub base_dir: PathBuf,

    /// Working directory under `base_dir` holding the open backup set.
    /// Everything in here is archived and deleted by the automator; it must
    /// not be used by anything else.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Directory under `base_dir` holding sealed archives. Non-directory
    /// entries in here are reserved for the automator.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
}

impl PathsConfig {
    /// Directory holding the current base + incremental folders.
    pub fn backup_root(&self) -> PathBuf {
        self.base_dir.join(&self.data_dir)
    }

    /// Directory holding sealed archive files.
    pub fn archive_root(&self) -> PathBuf {
        self.base_dir.join(&self.archive_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Folder name of the full backup at the root of a chain
    #[serde(default = "default_base_folder")]
    pub base_folder: String,

    /// Prefix for incremental folders; suffixed with a zero-based index
    #[serde(default = "default_incremental_prefix")]
    pub incremental_prefix: String,

    /// Prefix for sealed archive files; suffixed with the seal timestamp
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Backup tool executable (Percona XtraBackup or a wrapper)
    #[serde(default = "default_backup_command")]
    pub backup_command: String,

    /// Seconds to wait for the tool's password prompt. This is not a cap on
    /// the backup itself, which may legitimately run for hours.
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,

    /// Maximum age of the newest backup before the open set is considered
    /// stale and a fresh base is forced
    #[serde(default = "default_max_backup_age_secs")]
    pub max_backup_age_secs: u64,

    /// Extra arguments appended to every backup command, each prefixed
    /// with `--`
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Master switch for sealing and rotation
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Archive container format: "tar.gz" or "tar.zst"
    #[serde(default = "default_archive_format")]
    pub format: String,

    /// Number of sealed archives to keep; oldest beyond this are deleted
    #[serde(default = "default_retain_count")]
    pub retain_count: u32,

    /// Seal once the incremental count reaches `max_increments`
    #[serde(default)]
    pub max_increments_enabled: bool,

    #[serde(default = "default_max_increments")]
    pub max_increments: u64,

    /// Seal on any cycle that runs within `at_utc_hour`. Pairing this with
    /// the systemd timer chooses when the expensive base backup happens.
    /// Fires on every run within that hour if the timer runs more often
    /// than hourly.
    #[serde(default = "default_true")]
    pub at_hour_enabled: bool,

    #[serde(default = "default_at_utc_hour")]
    pub at_utc_hour: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Master switch for all logging
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Mirror the backup tool's output to the screen as it streams
    #[serde(default = "default_true")]
    pub echo_child_output: bool,

    /// Optional append-only log file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_data_dir() -> String {
    "mysql".to_string()
}

fn default_archive_dir() -> String {
    "archive".to_string()
}

fn default_base_folder() -> String {
    "base".to_string()
}

fn default_incremental_prefix() -> String {
    "inc_".to_string()
}

fn default_archive_prefix() -> String {
    "database_backup_".to_string()
}

fn default_backup_command() -> String {
    "xtrabackup".to_string()
}

fn default_prompt_timeout_secs() -> u64 {
    30
}

fn default_max_backup_age_secs() -> u64 {
    60 * 60 * 20
}

fn default_extra_args() -> Vec<String> {
    vec!["no-server-version-check".to_string()]
}

fn default_archive_format() -> String {
    "tar.gz".to_string()
}

fn default_retain_count() -> u32 {
    7
}

fn default_max_increments() -> u64 {
    4
}

fn default_at_utc_hour() -> u8 {
    6
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default() -> Self {
        Config {
            database: DatabaseConfig {
                user: "backup".to_string(),
                password: "".to_string(),
                host: default_host(),
                port: default_port(),
            },
            paths: PathsConfig {
                base_dir: PathBuf::from("/data/backups"),
                data_dir: default_data_dir(),
                archive_dir: default_archive_dir(),
            },
            naming: NamingConfig {
                base_folder: default_base_folder(),
                incremental_prefix: default_incremental_prefix(),
                archive_prefix: default_archive_prefix(),
            },
            general: GeneralConfig {
                backup_command: default_backup_command(),
                prompt_timeout_secs: default_prompt_timeout_secs(),
                max_backup_age_secs: default_max_backup_age_secs(),
                extra_args: default_extra_args(),
            },
            archive: ArchiveConfig {
                enabled: true,
                format: default_archive_format(),
                retain_count: default_retain_count(),
                max_increments_enabled: false,
                max_increments: default_max_increments(),
                at_hour_enabled: true,
                at_utc_hour: default_at_utc_hour(),
            },
            log: LogConfig {
                enabled: true,
                level: default_log_level(),
                echo_child_output: true,
                file: None,
            },
        }
    }

    /// Reject settings the engine cannot safely run with.
    pub fn validate(&self) -> Result<()> {
        if self.general.backup_command.trim().is_empty() {
            return Err(CycleError::Config("backup_command is empty".into()));
        }
        if self.general.prompt_timeout_secs == 0 {
            return Err(CycleError::Config(
                "prompt_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.general.max_backup_age_secs == 0 {
            return Err(CycleError::Config(
                "max_backup_age_secs must be greater than zero".into(),
            ));
        }
        if self.archive.at_utc_hour > 23 {
            return Err(CycleError::Config(format!(
                "at_utc_hour must be within 0-23, got {}",
                self.archive.at_utc_hour
            )));
        }
        if ArchiveFormat::parse(&self.archive.format).is_none() {
            return Err(CycleError::Config(format!(
                "unknown archive format \"{}\" (expected tar.gz or tar.zst)",
                self.archive.format
            )));
        }
        if self.paths.base_dir.as_os_str().is_empty() {
            return Err(CycleError::Config("base_dir is empty".into()));
        }
        if self.paths.data_dir.trim().is_empty() || self.paths.archive_dir.trim().is_empty() {
            return Err(CycleError::Config(
                "data_dir and archive_dir must not be empty".into(),
            ));
        }
        if self.naming.base_folder.trim().is_empty()
            || self.naming.incremental_prefix.trim().is_empty()
            || self.naming.archive_prefix.trim().is_empty()
        {
            return Err(CycleError::Config(
                "base_folder, incremental_prefix and archive_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}
