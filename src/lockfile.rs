//! Advisory lock against overlapping cycles.
//!
//! The scheduling trigger is contracted to never overlap invocations; the
//! lockfile guards against a misconfigured timer doing it anyway. The lock
//! lives in `base_dir`, outside the backup root, so clearing the working
//! directory can never release another process's lock. A lock whose pid is
//! no longer alive is reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::utils::errors::{CycleError, Result};

const LOCK_FILE_NAME: &str = ".xtrabackup-automator.lock";

/// Holds the cycle lock; removed on drop.
#[derive(Debug)]
pub struct CycleLock {
    path: PathBuf,
}

impl CycleLock {
    /// Acquire the lock under `base_dir`, reclaiming a stale one if its
    /// owner is gone.
    pub fn acquire(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(LOCK_FILE_NAME);

        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    debug!(lock = %path.display(), "Cycle lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = match fs::read_to_string(&path) {
                        Ok(text) => text.trim().parse::<u32>().ok(),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if let Some(pid) = holder {
                        if pid_is_alive(pid) {
                            return Err(CycleError::Locked(pid));
                        }
                    }
                    warn!(lock = %path.display(), "Reclaiming stale cycle lock");
                    match fs::remove_file(&path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Repeatedly lost the reclaim race to another process.
        Err(CycleError::Locked(0))
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(lock = %self.path.display(), error = %e, "Failed to remove cycle lock");
            }
        }
    }
}

fn pid_is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
