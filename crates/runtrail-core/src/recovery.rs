//! Startup recovery of working directories left by earlier processes.
//!
//! Recovery is best-effort and bounded: every sibling directory gets one
//! drain attempt per process start. Directories that fail stay on disk for
//! the next start. Directories whose owner lock is held belong to a live
//! run (or to another process recovering them) and are skipped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collector::Collector;
use crate::error::{Error, Result};
use crate::record::FileKind;
use crate::record_file::{count_records, temp_path_for};
use crate::registry::{FileRegistry, OWNER_LOCK_FILE, OwnerLock};
use crate::upload::drain;

/// What happened to the directories seen by one recovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Fully drained and removed.
    pub drained: Vec<PathBuf>,
    /// Left in place after a failure, with the reason.
    pub failed: Vec<(PathBuf, String)>,
    /// Owned by a live process.
    pub locked: Vec<PathBuf>,
    /// Records submitted across all directories.
    pub records: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Working directories under `temp_root` whose name starts with `prefix`,
/// sorted by name (run ids sort by creation time).
pub fn list_workdirs(temp_root: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(temp_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Drain every orphaned working directory under `temp_root` except `skip`.
pub fn recover_orphans(
    temp_root: &Path,
    prefix: &str,
    skip: Option<&Path>,
    collector: &dyn Collector,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let dirs = match list_workdirs(temp_root, prefix) {
        Ok(dirs) => dirs,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(root = %temp_root.display(), error = %err, "Cannot scan for orphaned runs");
            }
            return report;
        }
    };

    for dir in dirs {
        if skip == Some(dir.as_path()) {
            continue;
        }
        match recover_dir(&dir, collector) {
            Ok(records) => {
                report.records += records;
                report.drained.push(dir);
            }
            Err(Error::WorkingDirLocked { .. }) => {
                debug!(dir = %dir.display(), "Skipping working directory owned by a live run");
                report.locked.push(dir);
            }
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Recovery failed; leaving directory for a later start");
                report.failed.push((dir, err.to_string()));
            }
        }
    }

    if !report.drained.is_empty() || !report.failed.is_empty() {
        info!(
            drained = report.drained.len(),
            failed = report.failed.len(),
            locked = report.locked.len(),
            records = report.records,
            "Recovered orphaned runs"
        );
    }
    report
}

/// Drain one orphaned directory and remove it once nothing is left.
///
/// Every kind is attempted even if an earlier one fails; the first failure
/// is returned after all attempts.
pub fn recover_dir(dir: &Path, collector: &dyn Collector) -> Result<usize> {
    let registry = FileRegistry::detached(dir)?;
    let mut records = 0;
    let mut failures = Vec::new();
    for file in registry.iter() {
        match drain(file, collector) {
            Ok(sent) => records += sent,
            Err(err) => failures.push(format!("{}: {err}", file.kind())),
        }
    }
    if !failures.is_empty() {
        return Err(Error::Flush { failures });
    }

    let pending = registry
        .iter()
        .any(|f| f.exists() || f.tmp_path().exists());
    drop(registry);
    if !pending {
        fs::remove_dir_all(dir)?;
    }
    Ok(records)
}

/// State of one record stream on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub kind: FileKind,
    pub live: bool,
    pub live_records: usize,
    /// A reservation is parked under the `.tmp` name.
    pub pending_tmp: bool,
    pub tmp_records: usize,
}

/// State of one working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkdirStatus {
    pub dir: PathBuf,
    /// Held by a live process.
    pub owned: bool,
    pub files: Vec<FileStatus>,
}

impl WorkdirStatus {
    pub fn pending_records(&self) -> usize {
        self.files
            .iter()
            .map(|f| f.live_records + f.tmp_records)
            .sum()
    }
}

/// Read-only look at a working directory.
pub fn inspect_workdir(dir: &Path) -> io::Result<WorkdirStatus> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }
    let files = FileKind::ALL
        .into_iter()
        .map(|kind| {
            let live = dir.join(kind.file_name());
            let tmp = temp_path_for(&live);
            FileStatus {
                kind,
                live: live.exists(),
                live_records: count_records(&live).unwrap_or(0),
                pending_tmp: tmp.exists(),
                tmp_records: count_records(&tmp).unwrap_or(0),
            }
        })
        .collect();
    Ok(WorkdirStatus {
        dir: dir.to_path_buf(),
        owned: is_owned(dir),
        files,
    })
}

fn is_owned(dir: &Path) -> bool {
    if !dir.join(OWNER_LOCK_FILE).exists() {
        return false;
    }
    matches!(
        OwnerLock::acquire(dir),
        Err(Error::WorkingDirLocked { .. })
    )
}
