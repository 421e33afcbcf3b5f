//! Filesystem state inspection for the backup root.
//!
//! The folder layout under the backup root is the only durable record of
//! what backups exist; there is no separate metadata store. This module
//! derives the current cycle state from that layout and performs no writes.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use tracing::warn;

use crate::config::NamingConfig;

/// What currently exists under the backup root.
///
/// Calling [`inspect`] twice without a mutation in between yields an
/// identical snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    /// A base (full) backup folder exists
    pub has_base: bool,

    /// Number of incremental folders in the open chain; equals the next
    /// incremental suffix to use
    pub incremental_count: u64,

    /// Modification time of the most recently written entry, used to detect
    /// stale cycles
    pub newest_entry: Option<SystemTime>,
}

impl BackupSnapshot {
    fn empty() -> Self {
        Self {
            has_base: false,
            incremental_count: 0,
            newest_entry: None,
        }
    }
}

/// Read the backup root and classify its contents.
///
/// A missing root is not an error: it reads as "no base, zero increments".
/// Permission and other I/O faults propagate.
pub fn inspect(backup_root: &Path, naming: &NamingConfig) -> io::Result<BackupSnapshot> {
    let entries = match std::fs::read_dir(backup_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BackupSnapshot::empty()),
        Err(e) => return Err(e),
    };

    let mut has_base = false;
    let mut highest_suffix: Option<u64> = None;
    let mut incremental_folders = 0u64;
    let mut newest_entry: Option<SystemTime> = None;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.eq_ignore_ascii_case(&naming.base_folder) {
            has_base = true;
        } else if let Some(suffix) = parse_incremental_suffix(&name, &naming.incremental_prefix) {
            incremental_folders += 1;
            if highest_suffix.map_or(true, |prev| suffix > prev) {
                highest_suffix = Some(suffix);
            }
        }

        // Any entry counts toward recency, including stray files.
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if newest_entry.map_or(true, |prev| modified > prev) {
                newest_entry = Some(modified);
            }
        }
    }

    let incremental_count = highest_suffix.map_or(0, |suffix| suffix + 1);
    if incremental_folders != incremental_count {
        warn!(
            expected = incremental_count,
            found = incremental_folders,
            "Incremental chain has gaps; folder numbering is no longer contiguous"
        );
    }

    Ok(BackupSnapshot {
        has_base,
        incremental_count,
        newest_entry,
    })
}

/// Parse the numeric suffix out of an incremental folder name, e.g.
/// `inc_3` -> `Some(3)`.
fn parse_incremental_suffix(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn naming() -> NamingConfig {
        NamingConfig {
            base_folder: "base".to_string(),
            incremental_prefix: "inc_".to_string(),
            archive_prefix: "database_backup_".to_string(),
        }
    }

    #[test]
    fn test_missing_root_reads_as_empty() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let snapshot = inspect(&temp_dir.path().join("nope"), &naming())?;
        assert!(!snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 0);
        assert!(snapshot.newest_entry.is_none());
        Ok(())
    }

    #[test]
    fn test_empty_root() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let snapshot = inspect(temp_dir.path(), &naming())?;
        assert_eq!(snapshot, BackupSnapshot::empty());
        Ok(())
    }

    #[test]
    fn test_base_only() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("base"))?;

        let snapshot = inspect(temp_dir.path(), &naming())?;
        assert!(snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 0);
        assert!(snapshot.newest_entry.is_some());
        Ok(())
    }

    #[test]
    fn test_base_with_incrementals() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("base"))?;
        fs::create_dir(temp_dir.path().join("inc_0"))?;
        fs::create_dir(temp_dir.path().join("inc_1"))?;
        fs::create_dir(temp_dir.path().join("inc_2"))?;

        let snapshot = inspect(temp_dir.path(), &naming())?;
        assert!(snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 3);
        Ok(())
    }

    #[test]
    fn test_unrelated_entries_are_not_counted() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("base"))?;
        fs::create_dir(temp_dir.path().join("inc_0"))?;
        fs::create_dir(temp_dir.path().join("inc_not_a_number"))?;
        fs::write(temp_dir.path().join("stray.txt"), b"x")?;

        let snapshot = inspect(temp_dir.path(), &naming())?;
        assert_eq!(snapshot.incremental_count, 1);
        Ok(())
    }

    #[test]
    fn test_count_derives_from_highest_suffix() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("base"))?;
        // Gap: inc_0 is missing.
        fs::create_dir(temp_dir.path().join("inc_1"))?;

        let snapshot = inspect(temp_dir.path(), &naming())?;
        assert_eq!(snapshot.incremental_count, 2);
        Ok(())
    }

    #[test]
    fn test_inspection_is_idempotent() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("base"))?;
        fs::create_dir(temp_dir.path().join("inc_0"))?;

        let first = inspect(temp_dir.path(), &naming())?;
        let second = inspect(temp_dir.path(), &naming())?;
        assert_eq!(first, second);
        Ok(())
    }
}
