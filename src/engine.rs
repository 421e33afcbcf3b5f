//! Backup cycle decision engine.
//!
//! Each invocation re-derives the cycle state from the backup root, picks
//! exactly one action, and performs at most one backup and one seal. There
//! is no retry within an invocation: a failed cycle leaves the folder layout
//! exactly as it found it, and the next scheduled run is the retry.

use std::path::Path;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveFormat};
use crate::config::Config;
use crate::inspector::{self, BackupSnapshot};
use crate::lockfile::CycleLock;
use crate::supervisor::{self, BackupKind, BackupRequest, CommandOutcome};
use crate::utils::errors::{CycleError, Result};

/// The action picked for this invocation; derived fresh every time and
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    /// Clear the working directory and take a fresh base backup
    StartFresh,

    /// Extend the open chain by one incremental folder
    Incremental { next_index: u64 },

    /// Seal the current set into an archive, then take a fresh base
    SealThenStartFresh,
}

/// Terminal outcome of a successful invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    BackupAdded,
    ArchivedAndBaseAdded,
}

/// Pick the next action from the inspected state and the clock.
pub fn decide(snapshot: &BackupSnapshot, config: &Config, now: DateTime<Utc>) -> CycleDecision {
    if !snapshot.has_base {
        return CycleDecision::StartFresh;
    }

    // Staleness outranks everything: an incremental chain must not span an
    // arbitrarily long gap just because the timer was off for a while.
    let stale = snapshot.newest_entry.map_or(false, |newest| {
        let newest: DateTime<Utc> = newest.into();
        now.signed_duration_since(newest).num_seconds()
            > config.general.max_backup_age_secs as i64
    });
    if stale && !config.archive.enabled {
        warn!(
            max_age_secs = config.general.max_backup_age_secs,
            "Backup set is stale and archiving is disabled; discarding it for a fresh base"
        );
        return CycleDecision::StartFresh;
    }

    let mut seal = false;
    if stale {
        info!(
            max_age_secs = config.general.max_backup_age_secs,
            "Newest backup is too old; sealing and starting a fresh base"
        );
        seal = true;
    }
    if config.archive.enabled
        && config.archive.at_hour_enabled
        && now.hour() == config.archive.at_utc_hour as u32
    {
        info!(
            hour = config.archive.at_utc_hour,
            "Within the configured archive hour; sealing"
        );
        seal = true;
    }
    if config.archive.enabled
        && config.archive.max_increments_enabled
        && snapshot.incremental_count >= config.archive.max_increments
    {
        info!(
            count = snapshot.incremental_count,
            limit = config.archive.max_increments,
            "Incremental count reached the archive limit; sealing"
        );
        seal = true;
    }

    if seal {
        CycleDecision::SealThenStartFresh
    } else {
        CycleDecision::Incremental {
            next_index: snapshot.incremental_count,
        }
    }
}

/// Run one full backup cycle: inspect, decide, execute.
pub async fn run_cycle(config: &Config) -> Result<CycleOutcome> {
    config.validate()?;

    std::fs::create_dir_all(&config.paths.base_dir)?;
    let _lock = CycleLock::acquire(&config.paths.base_dir)?;

    let backup_root = config.paths.backup_root();
    std::fs::create_dir_all(&backup_root)?;

    let snapshot = inspector::inspect(&backup_root, &config.naming)?;
    debug!(
        has_base = snapshot.has_base,
        incremental_count = snapshot.incremental_count,
        "Inspected backup root"
    );

    let decision = decide(&snapshot, config, Utc::now());
    info!(?decision, "Cycle decision");

    match decision {
        CycleDecision::Incremental { next_index } => {
            let previous = if next_index == 0 {
                backup_root.join(&config.naming.base_folder)
            } else {
                backup_root.join(incremental_folder(config, next_index - 1))
            };
            let request = BackupRequest {
                kind: BackupKind::Incremental,
                target_dir: backup_root.join(incremental_folder(config, next_index)),
                incremental_basedir: Some(previous),
            };
            take_backup(&request, config).await?;
            Ok(CycleOutcome::BackupAdded)
        }
        CycleDecision::StartFresh => {
            archive::clear_backup_root(&backup_root)?;
            take_backup(&base_request(config), config).await?;
            Ok(CycleOutcome::BackupAdded)
        }
        CycleDecision::SealThenStartFresh => {
            seal_current_set(config).await?;
            take_backup(&base_request(config), config).await?;
            Ok(CycleOutcome::ArchivedAndBaseAdded)
        }
    }
}

fn incremental_folder(config: &Config, index: u64) -> String {
    format!("{}{}", config.naming.incremental_prefix, index)
}

fn base_request(config: &Config) -> BackupRequest {
    BackupRequest {
        kind: BackupKind::Base,
        target_dir: config.paths.backup_root().join(&config.naming.base_folder),
        incremental_basedir: None,
    }
}

/// Seal and rotate on a blocking task; compression of a large set is pure
/// CPU + disk work.
async fn seal_current_set(config: &Config) -> Result<()> {
    let backup_root = config.paths.backup_root();
    let archive_root = config.paths.archive_root();
    let naming = config.naming.clone();
    let format = ArchiveFormat::parse(&config.archive.format).ok_or_else(|| {
        CycleError::Config(format!("unknown archive format \"{}\"", config.archive.format))
    })?;
    let retain_count = config.archive.retain_count;

    let archive_path = tokio::task::spawn_blocking(move || {
        archive::seal_and_rotate(&backup_root, &archive_root, &naming, format, retain_count)
    })
    .await
    .map_err(|e| CycleError::Archive(format!("archive task failed: {e}")))??;

    info!(archive = %archive_path.display(), "Backup set sealed and rotated");
    Ok(())
}

/// Run one supervised backup command; on anything but success, remove the
/// partial target folder so the chain numbering stays intact.
async fn take_backup(request: &BackupRequest, config: &Config) -> Result<()> {
    let err = match supervisor::run_backup_command(request, config).await {
        Ok(CommandOutcome::Success { .. }) => {
            info!(target = %request.target_dir.display(), "Backup completed");
            return Ok(());
        }
        Ok(CommandOutcome::Timeout) => {
            CycleError::PromptTimeout(config.general.prompt_timeout_secs)
        }
        Ok(CommandOutcome::AuthRejected { .. }) => CycleError::AuthRejected,
        Ok(CommandOutcome::ToolError { exit_code, .. }) => CycleError::Tool(match exit_code {
            Some(code) => format!("backup tool exited with status {code}"),
            None => "backup tool was killed by a signal".to_string(),
        }),
        Err(e) => e,
    };

    remove_partial_target(config, &request.target_dir);
    Err(err)
}

/// Remove an aborted target folder. Refuses to touch anything outside the
/// backup root.
fn remove_partial_target(config: &Config, target: &Path) {
    let backup_root = config.paths.backup_root();
    if !target.starts_with(&backup_root) {
        warn!(
            target = %target.display(),
            "Refusing to delete a folder outside the backup root"
        );
        return;
    }
    match std::fs::remove_dir_all(target) {
        Ok(()) => info!(target = %target.display(), "Removed partial backup folder"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            target = %target.display(),
            error = %e,
            "Failed to remove partial backup folder"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const WELL_BEHAVED_TOOL: &str = r#"#!/bin/sh
target=""
for arg in "$@"; do
  case "$arg" in
    --target-dir=*) target="${arg#--target-dir=}" ;;
  esac
done
printf 'Enter password: ' >&2
read -r password
mkdir -p "$target"
printf '%s\n' "$@" > "$target/argv"
echo 'completed OK!' >&2
"#;

    /// Fails after having already created the target folder, the way the
    /// real tool can when it dies mid-copy.
    const FAILING_TOOL: &str = r#"#!/bin/sh
target=""
for arg in "$@"; do
  case "$arg" in
    --target-dir=*) target="${arg#--target-dir=}" ;;
  esac
done
printf 'Enter password: ' >&2
read -r _
mkdir -p "$target"
echo 'log scanned up to lsn' >&2
exit 1
"#;

    const AUTH_REJECTING_TOOL: &str = "#!/bin/sh\nprintf 'Enter password: ' >&2\nread -r _\n\
         echo \"ERROR 1045: Access denied for user\" >&2\nexit 1\n";

    fn write_tool(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn test_config(temp_dir: &TempDir, tool_body: &str) -> Config {
        let mut config = Config::default();
        config.paths.base_dir = temp_dir.path().to_path_buf();
        config.database.password = "hunter2".to_string();
        config.general.backup_command = write_tool(temp_dir.path(), "fake-xtrabackup", tool_body);
        config.general.prompt_timeout_secs = 5;
        // Keep the wall clock out of the picture unless a test opts in.
        config.archive.at_hour_enabled = false;
        config.archive.max_increments_enabled = false;
        config.log.echo_child_output = false;
        config
    }

    fn snapshot_of(config: &Config) -> BackupSnapshot {
        inspector::inspect(&config.paths.backup_root(), &config.naming).unwrap()
    }

    fn fixed_now(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 10, hour, 15, 0).unwrap()
    }

    fn fresh_snapshot(now: DateTime<Utc>, incremental_count: u64) -> BackupSnapshot {
        BackupSnapshot {
            has_base: true,
            incremental_count,
            newest_entry: Some(SystemTime::from(now - chrono::Duration::minutes(5))),
        }
    }

    #[test]
    fn test_decide_no_base_starts_fresh() {
        let config = Config::default();
        let snapshot = BackupSnapshot {
            has_base: false,
            incremental_count: 0,
            newest_entry: None,
        };
        assert_eq!(
            decide(&snapshot, &config, fixed_now(12)),
            CycleDecision::StartFresh
        );
    }

    #[test]
    fn test_decide_grows_chain_when_no_trigger_fires() {
        let mut config = Config::default();
        config.archive.at_hour_enabled = false;
        config.archive.max_increments_enabled = false;
        let now = fixed_now(12);

        assert_eq!(
            decide(&fresh_snapshot(now, 2), &config, now),
            CycleDecision::Incremental { next_index: 2 }
        );
    }

    #[test]
    fn test_decide_count_trigger_seals_at_threshold() {
        let mut config = Config::default();
        config.archive.at_hour_enabled = false;
        config.archive.max_increments_enabled = true;
        config.archive.max_increments = 4;
        let now = fixed_now(12);

        assert_eq!(
            decide(&fresh_snapshot(now, 3), &config, now),
            CycleDecision::Incremental { next_index: 3 }
        );
        assert_eq!(
            decide(&fresh_snapshot(now, 4), &config, now),
            CycleDecision::SealThenStartFresh
        );
    }

    #[test]
    fn test_decide_hour_trigger_fires_every_run_within_the_hour() {
        let mut config = Config::default();
        config.archive.at_hour_enabled = true;
        config.archive.at_utc_hour = 6;
        config.archive.max_increments_enabled = false;

        let first = Utc.with_ymd_and_hms(2023, 5, 10, 6, 5, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2023, 5, 10, 6, 55, 0).unwrap();
        assert_eq!(
            decide(&fresh_snapshot(first, 1), &config, first),
            CycleDecision::SealThenStartFresh
        );
        assert_eq!(
            decide(&fresh_snapshot(second, 1), &config, second),
            CycleDecision::SealThenStartFresh
        );

        let outside = fixed_now(7);
        assert_eq!(
            decide(&fresh_snapshot(outside, 1), &config, outside),
            CycleDecision::Incremental { next_index: 1 }
        );
    }

    #[test]
    fn test_decide_triggers_are_inert_when_archiving_disabled() {
        let mut config = Config::default();
        config.archive.enabled = false;
        config.archive.at_hour_enabled = true;
        config.archive.at_utc_hour = 6;
        config.archive.max_increments_enabled = true;
        config.archive.max_increments = 1;
        let now = Utc.with_ymd_and_hms(2023, 5, 10, 6, 5, 0).unwrap();

        assert_eq!(
            decide(&fresh_snapshot(now, 3), &config, now),
            CycleDecision::Incremental { next_index: 3 }
        );
    }

    #[test]
    fn test_decide_stale_set_seals_when_archiving_enabled() {
        let mut config = Config::default();
        config.archive.at_hour_enabled = false;
        let now = fixed_now(12);
        let snapshot = BackupSnapshot {
            has_base: true,
            incremental_count: 2,
            newest_entry: Some(SystemTime::from(now - chrono::Duration::hours(21))),
        };

        assert_eq!(
            decide(&snapshot, &config, now),
            CycleDecision::SealThenStartFresh
        );
    }

    #[test]
    fn test_decide_stale_set_is_discarded_when_archiving_disabled() {
        let mut config = Config::default();
        config.archive.enabled = false;
        let now = fixed_now(12);
        let snapshot = BackupSnapshot {
            has_base: true,
            incremental_count: 2,
            newest_entry: Some(SystemTime::from(now - chrono::Duration::hours(21))),
        };

        assert_eq!(decide(&snapshot, &config, now), CycleDecision::StartFresh);
    }

    #[tokio::test]
    async fn test_cycle_bootstraps_a_base() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, WELL_BEHAVED_TOOL);

        let outcome = run_cycle(&config).await.unwrap();
        assert_eq!(outcome, CycleOutcome::BackupAdded);

        let snapshot = snapshot_of(&config);
        assert!(snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 0);
    }

    #[tokio::test]
    async fn test_cycle_grows_the_chain_one_folder_at_a_time() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, WELL_BEHAVED_TOOL);

        run_cycle(&config).await.unwrap();
        run_cycle(&config).await.unwrap();
        run_cycle(&config).await.unwrap();

        let snapshot = snapshot_of(&config);
        assert!(snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 2);

        let backup_root = config.paths.backup_root();
        let argv_0 = fs::read_to_string(backup_root.join("inc_0").join("argv")).unwrap();
        assert!(argv_0.contains(&format!(
            "--incremental-basedir={}",
            backup_root.join("base").display()
        )));
        let argv_1 = fs::read_to_string(backup_root.join("inc_1").join("argv")).unwrap();
        assert!(argv_1.contains(&format!(
            "--incremental-basedir={}",
            backup_root.join("inc_0").display()
        )));
    }

    #[tokio::test]
    async fn test_cycle_seals_on_count_trigger() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir, WELL_BEHAVED_TOOL);
        config.archive.max_increments_enabled = true;
        config.archive.max_increments = 2;

        // base, inc_0, inc_1, then the trigger fires.
        run_cycle(&config).await.unwrap();
        run_cycle(&config).await.unwrap();
        run_cycle(&config).await.unwrap();
        let outcome = run_cycle(&config).await.unwrap();
        assert_eq!(outcome, CycleOutcome::ArchivedAndBaseAdded);

        let snapshot = snapshot_of(&config);
        assert!(snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 0);

        let archives: Vec<_> = fs::read_dir(config.paths.archive_root())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archives.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_tool_leaves_state_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, WELL_BEHAVED_TOOL);
        run_cycle(&config).await.unwrap();
        run_cycle(&config).await.unwrap();
        let before = snapshot_of(&config);

        let mut failing = config.clone();
        failing.general.backup_command =
            write_tool(temp_dir.path(), "failing-xtrabackup", FAILING_TOOL);
        let result = run_cycle(&failing).await;
        assert!(matches!(result, Err(CycleError::Tool(_))));

        // The partial inc_1 the tool left behind has been removed.
        assert!(!config.paths.backup_root().join("inc_1").exists());
        assert_eq!(snapshot_of(&config).has_base, before.has_base);
        assert_eq!(
            snapshot_of(&config).incremental_count,
            before.incremental_count
        );
    }

    #[tokio::test]
    async fn test_auth_rejection_aborts_without_changes() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, WELL_BEHAVED_TOOL);
        run_cycle(&config).await.unwrap();
        let before = snapshot_of(&config);

        let mut rejecting = config.clone();
        rejecting.general.backup_command =
            write_tool(temp_dir.path(), "rejecting-xtrabackup", AUTH_REJECTING_TOOL);
        let result = run_cycle(&rejecting).await;
        assert!(matches!(result, Err(CycleError::AuthRejected)));
        assert_eq!(snapshot_of(&config), before);
    }

    #[tokio::test]
    async fn test_prompt_timeout_aborts_without_changes() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, WELL_BEHAVED_TOOL);
        run_cycle(&config).await.unwrap();
        let before = snapshot_of(&config);

        let mut silent = config.clone();
        silent.general.backup_command =
            write_tool(temp_dir.path(), "silent-xtrabackup", "#!/bin/sh\nexec sleep 5\n");
        silent.general.prompt_timeout_secs = 1;
        let result = run_cycle(&silent).await;
        assert!(matches!(result, Err(CycleError::PromptTimeout(1))));
        assert_eq!(snapshot_of(&config), before);
    }

    #[tokio::test]
    async fn test_stale_set_is_discarded_without_archiving() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir, WELL_BEHAVED_TOOL);
        config.archive.enabled = false;
        config.general.max_backup_age_secs = 1;

        run_cycle(&config).await.unwrap();
        run_cycle(&config).await.unwrap();
        assert_eq!(snapshot_of(&config).incremental_count, 1);

        std::thread::sleep(std::time::Duration::from_secs(2));
        let outcome = run_cycle(&config).await.unwrap();
        assert_eq!(outcome, CycleOutcome::BackupAdded);

        let snapshot = snapshot_of(&config);
        assert!(snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 0);
        assert!(!config.paths.archive_root().exists());
    }

    #[tokio::test]
    async fn test_stale_set_is_sealed_when_archiving_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir, WELL_BEHAVED_TOOL);
        config.general.max_backup_age_secs = 1;

        run_cycle(&config).await.unwrap();
        std::thread::sleep(std::time::Duration::from_secs(2));
        let outcome = run_cycle(&config).await.unwrap();
        assert_eq!(outcome, CycleOutcome::ArchivedAndBaseAdded);

        let snapshot = snapshot_of(&config);
        assert!(snapshot.has_base);
        assert_eq!(snapshot.incremental_count, 0);
        assert_eq!(fs::read_dir(config.paths.archive_root()).unwrap().count(), 1);
    }
}
