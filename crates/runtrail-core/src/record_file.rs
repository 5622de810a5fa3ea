//! Append-only record files.
//!
//! A [`RecordFile`] is a stable handle for one stream of a run. The backing
//! path may be renamed away by the upload protocol at any time the lock is
//! free; the next write then recreates the file, header first. This
//! auto-recreate rule is what makes rotation invisible to writers.
//!
//! Two locks guard a file:
//! - the write lock ([`RecordFile::lock`]) serializes appends, header writes
//!   and the rename half of the upload handoff;
//! - the upload slot ([`RecordFile::upload_slot`]) is held by whoever is
//!   uploading the file, so the worker and `finish` never upload the same
//!   reservation twice. Writers never take it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};
use crate::record::{DataRecord, FileKind, RecordHeader, TEMP_FILE_SUFFIX, parse_header_line};
use crate::run::Run;
use crate::upload::Reservation;

/// One record stream inside a run's working directory.
#[derive(Debug)]
pub struct RecordFile {
    path: PathBuf,
    tmp_path: PathBuf,
    kind: FileKind,
    run: Option<Arc<Run>>,
    lock: Mutex<()>,
    upload: Mutex<()>,
}

impl RecordFile {
    /// A writable file whose header is derived from `run`.
    #[must_use]
    pub fn new(dir: &Path, kind: FileKind, run: Arc<Run>) -> Self {
        Self::build(dir, kind, Some(run))
    }

    /// A file left behind by another process; it can be read and uploaded
    /// but never recreated, since its run metadata is only in its header.
    #[must_use]
    pub fn detached(dir: &Path, kind: FileKind) -> Self {
        Self::build(dir, kind, None)
    }

    fn build(dir: &Path, kind: FileKind, run: Option<Arc<Run>>) -> Self {
        let path = dir.join(kind.file_name());
        let tmp_path = temp_path_for(&path);
        Self {
            path,
            tmp_path,
            kind,
            run,
            lock: Mutex::new(()),
            upload: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path the live file is renamed to while reserved for upload.
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Acquire the write lock.
    pub fn lock(&self) -> FileGuard<'_> {
        FileGuard {
            file: self,
            _guard: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Acquire the upload slot.
    pub fn upload_slot(&self) -> MutexGuard<'_, ()> {
        self.upload.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `content`, recreating the file with a fresh header first if it
    /// was renamed away.
    pub fn write(&self, content: &str) -> Result<()> {
        self.lock().write(content)
    }

    /// Serialize and append one data record.
    pub fn write_record(&self, record: &DataRecord) -> Result<()> {
        self.write(&record.to_line()?)
    }

    /// Overwrite the file with exactly `content`.
    pub fn write_header(&self, content: &str) -> Result<()> {
        self.lock().write_header(content)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// True if a non-empty line exists after the header.
    pub fn has_records(&self) -> bool {
        has_records(&self.path)
    }

    /// Time since the last modification.
    pub fn age(&self) -> io::Result<Duration> {
        age(&self.path)
    }

    /// Whether the file's last byte is a newline. Missing files report
    /// `false`; empty files report `true`.
    pub fn ends_with_newline(&self) -> bool {
        ends_with_newline(&self.path).unwrap_or(false)
    }

    /// Parse the first line as a header row.
    ///
    /// Does not check existence first; callers that just observed the file
    /// under the lock pass straight through, so a concurrent rename cannot
    /// slip in between a check here and the read.
    pub fn read_header(&self) -> Option<RecordHeader> {
        read_header(&self.path)
    }
}

/// Proof that the write lock of a [`RecordFile`] is held.
///
/// Every operation a caller performs "with the lock already held" goes
/// through this guard instead of re-locking.
pub struct FileGuard<'a> {
    file: &'a RecordFile,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> FileGuard<'a> {
    pub fn file(&self) -> &'a RecordFile {
        self.file
    }

    pub fn exists(&self) -> bool {
        self.file.exists()
    }

    pub fn has_records(&self) -> bool {
        self.file.has_records()
    }

    pub fn size(&self) -> io::Result<u64> {
        fs::metadata(&self.file.path).map(|m| m.len())
    }

    pub fn age(&self) -> io::Result<Duration> {
        self.file.age()
    }

    /// Append `content`, writing a fresh header first when the live path is
    /// missing.
    pub fn write(&mut self, content: &str) -> Result<()> {
        let path = &self.file.path;
        let mut prefix = "";
        if !path.exists() {
            let Some(run) = &self.file.run else {
                return Err(Error::MissingHeader { path: path.clone() });
            };
            self.write_header(&run.header(self.file.kind).to_line()?)?;
        } else if !self.file.ends_with_newline() {
            // A previous writer died mid-line; keep its fragment isolated.
            prefix = "\n";
        }

        let mut out = OpenOptions::new().create(true).append(true).open(path)?;
        if prefix.is_empty() {
            out.write_all(content.as_bytes())?;
        } else {
            let mut buf = String::with_capacity(prefix.len() + content.len());
            buf.push_str(prefix);
            buf.push_str(content);
            out.write_all(buf.as_bytes())?;
        }
        Ok(())
    }

    /// Overwrite the file with exactly `content`.
    pub fn write_header(&mut self, content: &str) -> Result<()> {
        fs::write(&self.file.path, content)?;
        Ok(())
    }

    /// Phase one of the upload handoff: hand the file's current contents to
    /// the uploader.
    ///
    /// - A `.tmp` sibling left by an earlier attempt is adopted as-is; the
    ///   live file waits for the next reservation.
    /// - A live file with no data records is deleted; nothing is uploaded.
    /// - Otherwise the live file is renamed to its `.tmp` sibling. From this
    ///   point writers recreate a fresh live file, so the lock can be
    ///   released as soon as this guard drops.
    pub fn reserve(self) -> Result<Option<Reservation<'a>>> {
        let file = self.file;
        if file.tmp_path.exists() {
            return Ok(Some(Reservation::new(file, true)));
        }
        if !file.path.exists() {
            return Ok(None);
        }
        if !file.has_records() {
            fs::remove_file(&file.path)?;
            tracing::debug!(
                kind = %file.kind,
                path = %file.path.display(),
                "Removed record file without data records"
            );
            return Ok(None);
        }
        fs::rename(&file.path, &file.tmp_path)?;
        Ok(Some(Reservation::new(file, false)))
    }
}

/// `<path>.tmp`
#[must_use]
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Parse the first line of `path` as a header row.
#[must_use]
pub fn read_header(path: &Path) -> Option<RecordHeader> {
    let file = File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    parse_header_line(&first)
}

/// True if `path` has a non-blank line after its first line. Stops at the
/// first such line. Lines are compared as raw bytes, so a torn multi-byte
/// character still counts as a line.
#[must_use]
pub fn has_records(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    // An unreadable file is handed to the uploader, which reports the error.
    data_lines(file).next().is_some()
}

/// Count non-blank lines after the first line.
pub fn count_records(path: &Path) -> io::Result<usize> {
    let mut count = 0;
    for line in data_lines(File::open(path)?) {
        line?;
        count += 1;
    }
    Ok(count)
}

/// Non-blank byte lines after the header line.
fn data_lines(file: File) -> impl Iterator<Item = io::Result<Vec<u8>>> {
    BufReader::new(file)
        .split(b'\n')
        .skip(1)
        .filter(|line| !matches!(line, Ok(bytes) if bytes.trim_ascii().is_empty()))
}

fn age(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

pub(crate) fn ends_with_newline(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
