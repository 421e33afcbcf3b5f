//! Archive sealing and retention for completed backup sets.
//!
//! Sealing compresses the whole backup root into one timestamped container
//! under the archive root, then clears the working directory so the next
//! cycle starts from scratch. Source data is deleted only after the archive
//! has been fully written and renamed into place; a crash mid-seal leaves an
//! `.incomplete` leftover that retention never counts.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::NamingConfig;
use crate::utils::errors::{CycleError, Result};

/// Timestamp embedded in archive file names,
/// e.g. `database_backup_11_28_2022__06_25_03.tar.gz`.
pub const TIMESTAMP_FORMAT: &str = "%m_%d_%Y__%H_%M_%S";

/// Suffix of an archive still being written.
const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Supported archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZstd,
}

impl ArchiveFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tar.gz" | "gztar" => Some(ArchiveFormat::TarGz),
            "tar.zst" | "zstd" => Some(ArchiveFormat::TarZstd),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::TarZstd => ".tar.zst",
        }
    }
}

/// Seal the current backup set into one archive, clear the backup root, and
/// enforce the retention count. Returns the path of the new archive.
pub fn seal_and_rotate(
    backup_root: &Path,
    archive_root: &Path,
    naming: &NamingConfig,
    format: ArchiveFormat,
    retain_count: u32,
) -> Result<PathBuf> {
    fs::create_dir_all(archive_root).map_err(|e| {
        CycleError::Archive(format!(
            "cannot create archive directory {}: {e}",
            archive_root.display()
        ))
    })?;

    let stamp = Utc::now().format(TIMESTAMP_FORMAT);
    let file_name = format!("{}{}{}", naming.archive_prefix, stamp, format.extension());
    let final_path = archive_root.join(&file_name);
    let tmp_path = archive_root.join(format!("{file_name}{INCOMPLETE_SUFFIX}"));

    let (set_files, set_bytes) = measure_set(backup_root);
    info!(
        files = set_files,
        bytes = set_bytes,
        archive = %final_path.display(),
        "Sealing backup set"
    );
    let started = Instant::now();

    if let Err(e) = write_archive(backup_root, &tmp_path, format) {
        let _ = fs::remove_file(&tmp_path);
        return Err(CycleError::Archive(format!(
            "failed to write {}: {e}",
            tmp_path.display()
        )));
    }
    fs::rename(&tmp_path, &final_path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        CycleError::Archive(format!("failed to finalize {}: {e}", final_path.display()))
    })?;

    info!(
        elapsed_secs = started.elapsed().as_secs(),
        "Archive sealed"
    );

    // Only now is the source data expendable.
    clear_backup_root(backup_root)?;

    enforce_retention(archive_root, naming, retain_count)?;

    Ok(final_path)
}

/// Remove every entry under the backup root, leaving the root itself.
pub(crate) fn clear_backup_root(backup_root: &Path) -> Result<()> {
    for entry in fs::read_dir(backup_root)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Parse the timestamp embedded in an archive file name. Returns `None` for
/// anything that is not a finished archive of ours (including `.incomplete`
/// leftovers).
pub(crate) fn parse_archive_timestamp(file_name: &str, prefix: &str) -> Option<NaiveDateTime> {
    let rest = file_name.strip_prefix(prefix)?;
    let stamp = rest
        .strip_suffix(ArchiveFormat::TarGz.extension())
        .or_else(|| rest.strip_suffix(ArchiveFormat::TarZstd.extension()))?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

fn write_archive(backup_root: &Path, dest: &Path, format: ArchiveFormat) -> std::io::Result<()> {
    // Archive-internal layout is the backup root as its own top-level
    // directory, so extraction recreates the tree next to the archive.
    let tree_name = backup_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup".to_string());

    let writer = BufWriter::new(File::create(dest)?);
    match format {
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(writer, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(&tree_name, backup_root)?;
            let encoder = builder.into_inner()?;
            let mut writer = encoder.finish()?;
            writer.flush()?;
        }
        ArchiveFormat::TarZstd => {
            let encoder = zstd::Encoder::new(writer, 0)?;
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(&tree_name, backup_root)?;
            let encoder = builder.into_inner()?;
            let mut writer = encoder.finish()?;
            writer.flush()?;
        }
    }
    Ok(())
}

/// Delete the oldest archives until at most `retain_count` remain.
///
/// Ordering uses the timestamp embedded in the file name, not the mtime, so
/// rotation stays correct even if archives were copied or touched
/// externally. Subdirectories are never deleted; unrecognized plain files
/// are left alone.
fn enforce_retention(archive_root: &Path, naming: &NamingConfig, retain_count: u32) -> Result<()> {
    let mut archives: Vec<(NaiveDateTime, PathBuf)> = Vec::new();

    let entries = fs::read_dir(archive_root).map_err(|e| {
        CycleError::Archive(format!(
            "cannot read archive directory {}: {e}",
            archive_root.display()
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| CycleError::Archive(e.to_string()))?;
        if entry.file_type().map_err(|e| CycleError::Archive(e.to_string()))?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match parse_archive_timestamp(&name, &naming.archive_prefix) {
            Some(stamp) => archives.push((stamp, entry.path())),
            None => debug!(entry = %name, "Ignoring unrecognized entry in archive directory"),
        }
    }

    if archives.len() <= retain_count as usize {
        debug!(
            count = archives.len(),
            retain = retain_count,
            "Archive count within the retention limit"
        );
        return Ok(());
    }

    archives.sort_by_key(|(stamp, _)| *stamp);
    let excess = archives.len() - retain_count as usize;
    for (_, path) in archives.drain(..excess) {
        fs::remove_file(&path).map_err(|e| {
            CycleError::Archive(format!("failed to delete old archive {}: {e}", path.display()))
        })?;
        info!(archive = %path.display(), "Purged archive beyond the retention limit");
    }

    Ok(())
}

fn measure_set(root: &Path) -> (usize, u64) {
    let mut files = 0usize;
    let mut bytes = 0u64;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (files, bytes)
}
