//! File registry: the total mapping from [`FileKind`] to [`RecordFile`] for
//! one working directory, plus the directory's ownership lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;

use crate::error::{Error, Result};
use crate::record::FileKind;
use crate::record_file::RecordFile;
use crate::run::Run;

/// Name of the advisory lock file inside every working directory.
pub const OWNER_LOCK_FILE: &str = ".owner.lock";

/// Exclusive advisory lock on a working directory, released on drop.
#[derive(Debug)]
pub struct OwnerLock {
    _lock_file: File,
    path: PathBuf,
}

impl OwnerLock {
    /// Take the lock without blocking. A lock held elsewhere (another live
    /// run, or another process recovering the directory) yields
    /// [`Error::WorkingDirLocked`].
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(OWNER_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                _lock_file: lock_file,
                path,
            }),
            Err(e) if is_contended(&e) => Err(Error::WorkingDirLocked {
                path: dir.to_path_buf(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Every record file of one working directory.
#[derive(Debug)]
pub struct FileRegistry {
    dir: PathBuf,
    log: RecordFile,
    history: RecordFile,
    _owner: OwnerLock,
}

impl FileRegistry {
    /// Registry for a live run. Files are created lazily on first write.
    pub fn open(dir: &Path, run: Arc<Run>) -> Result<Self> {
        let owner = OwnerLock::acquire(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            log: RecordFile::new(dir, FileKind::Log, Arc::clone(&run)),
            history: RecordFile::new(dir, FileKind::History, run),
            _owner: owner,
        })
    }

    /// Registry over a directory left by another process. Its files can be
    /// drained but never recreated.
    pub fn detached(dir: &Path) -> Result<Self> {
        let owner = OwnerLock::acquire(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            log: RecordFile::detached(dir, FileKind::Log),
            history: RecordFile::detached(dir, FileKind::History),
            _owner: owner,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, kind: FileKind) -> &RecordFile {
        match kind {
            FileKind::Log => &self.log,
            FileKind::History => &self.history,
        }
    }

    /// Files in [`FileKind::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = &RecordFile> {
        FileKind::ALL.into_iter().map(move |kind| self.get(kind))
    }
}
