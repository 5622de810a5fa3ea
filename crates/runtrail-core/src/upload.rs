//! Upload protocol and background worker.
//!
//! Uploading a record file is a two-phase handoff:
//!
//! 1. **Reserve** under the file's write lock ([`FileGuard::reserve`]): the
//!    live file is renamed to its `.tmp` sibling. Writers that come later
//!    recreate a fresh live file, header first.
//! 2. **Send** lock-free ([`Reservation::send`]): the `.tmp` file is parsed
//!    into one [`RecordBatch`], submitted, and deleted on success. On any
//!    failure the reservation is restored under the name it came from, so
//!    nothing is lost and nothing is sent twice.
//!
//! Whoever reserves also holds the file's upload slot until the send
//! completes, which keeps the worker and `finish` from both uploading the
//! same reservation.
//!
//! [`FileGuard::reserve`]: crate::record_file::FileGuard::reserve

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, warn};

use crate::collector::Collector;
use crate::config::UploadPolicy;
use crate::error::{Error, Result};
use crate::record::{RecordBatch, parse_record_line};
use crate::record_file::{FileGuard, RecordFile, ends_with_newline, read_header};
use crate::registry::FileRegistry;

/// Upper bound on reserve/send rounds per drain: a leftover `.tmp`, then the
/// live file, then anything written while those were in flight.
pub const MAX_DRAIN_PASSES: usize = 3;

/// A record file's contents handed to the uploader.
///
/// Exists only between a successful reserve and the end of [`Self::send`].
#[derive(Debug)]
#[must_use = "a reservation must be sent, or its data stays parked in the .tmp file"]
pub struct Reservation<'a> {
    file: &'a RecordFile,
    adopted: bool,
}

impl<'a> Reservation<'a> {
    pub(crate) fn new(file: &'a RecordFile, adopted: bool) -> Self {
        Self { file, adopted }
    }

    /// True if the `.tmp` file was left by an earlier attempt rather than
    /// produced by this reservation's rename.
    pub fn adopted(&self) -> bool {
        self.adopted
    }

    pub fn path(&self) -> &Path {
        self.file.tmp_path()
    }

    /// Parse, submit and delete the reserved file. Returns the number of
    /// records submitted; zero means the file held no valid record and was
    /// deleted without contacting the collector.
    pub fn send(self, collector: &dyn Collector) -> Result<usize> {
        let batch = match self.read_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                fs::remove_file(self.path())?;
                debug!(
                    kind = %self.file.kind(),
                    path = %self.path().display(),
                    "Removed reserved file without valid records"
                );
                return Ok(0);
            }
            Err(err) => {
                self.restore_or_warn();
                return Err(err);
            }
        };

        if let Err(err) = collector.submit_record_batch(&batch) {
            self.restore_or_warn();
            return Err(err.into());
        }

        fs::remove_file(self.path())?;
        // Below info: under console capture, stderr events become LOG records.
        debug!(
            run_id = %batch.run_id,
            kind = %batch.kind,
            records = batch.records.len(),
            "Uploaded record batch"
        );
        Ok(batch.records.len())
    }

    fn read_batch(&self) -> Result<Option<RecordBatch>> {
        let path = self.path();
        if fs::metadata(path)?.len() == 0 {
            return Ok(None);
        }
        let Some(header) = read_header(path) else {
            return Err(Error::MissingHeader {
                path: path.to_path_buf(),
            });
        };

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(File::open(path)?).split(b'\n').skip(1) {
            let line = line?;
            let Ok(text) = std::str::from_utf8(&line) else {
                skipped += 1;
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            match parse_record_line(text) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                run_id = %header.run_id,
                kind = %self.file.kind(),
                skipped,
                "Skipped malformed record lines"
            );
        }
        if records.is_empty() {
            return Ok(None);
        }

        Ok(Some(RecordBatch {
            run_id: header.run_id,
            project: header.project,
            kind: self.file.kind(),
            records,
        }))
    }

    /// Put the reserved data back under the live name.
    ///
    /// If a writer recreated the live file in the meantime, its records are
    /// newer: they are appended to the reserved data (minus their header)
    /// before the rename, so both survive in order.
    fn restore(&self) -> Result<()> {
        let _guard = self.file.lock();
        let live = self.file.path();
        let reserved = self.path();

        if live.exists() {
            let fresh = fs::read(live)?;
            let data = match fresh.iter().position(|b| *b == b'\n') {
                Some(end) => &fresh[end + 1..],
                None => &[][..],
            };
            if !data.is_empty() {
                let mut out = OpenOptions::new().append(true).open(reserved)?;
                if !ends_with_newline(reserved)? {
                    out.write_all(b"\n")?;
                }
                out.write_all(data)?;
            }
        }
        fs::rename(reserved, live)?;
        Ok(())
    }

    fn restore_or_warn(&self) {
        if let Err(err) = self.restore() {
            warn!(
                kind = %self.file.kind(),
                path = %self.path().display(),
                error = %err,
                "Failed to restore reserved file; it will be retried from its .tmp name"
            );
        }
    }
}

/// Upload every pending reservation of `file`, ignoring readiness.
///
/// Used by `finish` and by recovery. Stops at the first failure.
pub fn drain(file: &RecordFile, collector: &dyn Collector) -> Result<usize> {
    let _slot = file.upload_slot();
    let mut sent = 0;
    for _ in 0..MAX_DRAIN_PASSES {
        let Some(reservation) = file.lock().reserve()? else {
            break;
        };
        sent += reservation.send(collector)?;
    }
    Ok(sent)
}

/// One worker step for `file`: reserve and send if the file is ready.
pub fn upload_if_ready(
    file: &RecordFile,
    collector: &dyn Collector,
    policy: &UploadPolicy,
) -> Result<usize> {
    let _slot = file.upload_slot();
    let guard = file.lock();
    if !is_ready(&guard, policy) {
        return Ok(0);
    }
    match guard.reserve()? {
        Some(reservation) => reservation.send(collector),
        None => Ok(0),
    }
}

/// A leftover reservation is always ready. A live file is ready once it
/// outgrows `max_file_bytes`, or has records and has not been written for
/// `min_file_age`.
fn is_ready(guard: &FileGuard<'_>, policy: &UploadPolicy) -> bool {
    if guard.file().tmp_path().exists() {
        return true;
    }
    if !guard.exists() {
        return false;
    }
    if guard.size().is_ok_and(|size| size > policy.max_file_bytes) {
        return true;
    }
    guard.has_records()
        && guard
            .age()
            .is_ok_and(|age| age > policy.min_file_age())
}

/// Snapshot of worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub uploads: u64,
    pub records: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    uploads: AtomicU64,
    records: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Background thread polling a run's files.
///
/// Stopping is cooperative: the stop signal is observed between cycles, so
/// a cycle in the middle of a submission finishes it first.
#[derive(Debug)]
pub struct UploadWorker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl UploadWorker {
    pub fn spawn(
        registry: Arc<FileRegistry>,
        collector: Arc<dyn Collector>,
        policy: UploadPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        // Never sent on; the sender dropping when the thread exits is the
        // completion signal.
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let counters = Arc::new(Counters::default());
        let thread_counters = Arc::clone(&counters);

        let handle = thread::Builder::new()
            .name("runtrail-upload".to_string())
            .spawn(move || {
                let _done = done_tx;
                worker_loop(
                    &registry,
                    collector.as_ref(),
                    &policy,
                    &stop_rx,
                    &thread_counters,
                );
            })?;

        Ok(Self {
            stop_tx,
            done_rx,
            handle: Some(handle),
            counters,
        })
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker and wait up to `timeout` for its current cycle to
    /// end. Returns false if it did not quiesce in time; the thread is then
    /// detached and exits after its cycle.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let _ = self.stop_tx.try_send(());
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("Upload worker panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Upload worker did not stop in time; detaching"
                );
                false
            }
        }
    }
}

impl Drop for UploadWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop_tx.try_send(());
        }
    }
}

fn worker_loop(
    registry: &FileRegistry,
    collector: &dyn Collector,
    policy: &UploadPolicy,
    stop_rx: &Receiver<()>,
    counters: &Counters,
) {
    debug!(dir = %registry.dir().display(), "Upload worker started");
    let mut delay = policy.poll_interval();
    loop {
        match stop_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let failed = run_cycle(registry, collector, policy, counters);
        delay = if failed {
            policy.error_backoff()
        } else {
            policy.poll_interval()
        };
    }
    debug!(dir = %registry.dir().display(), "Upload worker stopped");
}

/// Returns true if any file failed; kinds are processed independently.
fn run_cycle(
    registry: &FileRegistry,
    collector: &dyn Collector,
    policy: &UploadPolicy,
    counters: &Counters,
) -> bool {
    counters.cycles.fetch_add(1, Ordering::Relaxed);
    let mut failed = false;
    for file in registry.iter() {
        match upload_if_ready(file, collector, policy) {
            Ok(0) => {}
            Ok(records) => {
                counters.uploads.fetch_add(1, Ordering::Relaxed);
                counters.records.fetch_add(records as u64, Ordering::Relaxed);
            }
            Err(err) => {
                failed = true;
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = %file.kind(),
                    error = %err,
                    retryable = err.is_retryable(),
                    "Upload failed; file kept for the next cycle"
                );
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MemoryCollector;
    use crate::record::{DataRecord, FileKind};
    use crate::run::Run;
    use std::time::Instant;
    use tempfile::tempdir;

    fn run() -> Arc<Run> {
        Arc::new(Run::new("abc123", "proj"))
    }

    fn write_records(file: &RecordFile, n: usize) {
        for i in 0..n {
            file.write_record(&DataRecord::now(format!("{{\"i\":{i}}}")))
                .unwrap();
        }
    }

    fn immediate() -> UploadPolicy {
        UploadPolicy {
            min_file_age_ms: 0,
            poll_interval_ms: 10,
            error_backoff_ms: 20,
            ..UploadPolicy::default()
        }
    }

    #[test]
    fn send_submits_and_deletes() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::History, run());
        write_records(&file, 3);
        let collector = MemoryCollector::new();

        let reservation = file.lock().reserve().unwrap().unwrap();
        assert_eq!(reservation.send(&collector).unwrap(), 3);

        assert!(!file.exists());
        assert!(!file.tmp_path().exists());
        let batches = collector.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].run_id, "abc123");
        assert_eq!(batches[0].project, "proj");
        assert_eq!(batches[0].kind, FileKind::History);
        assert_eq!(batches[0].records[2].payload_json, "{\"i\":2}");
    }

    #[test]
    fn failed_submit_restores_byte_for_byte() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::Log, run());
        write_records(&file, 4);
        let before = fs::read(file.path()).unwrap();
        let collector = MemoryCollector::new();
        collector.fail_next_submit("unavailable");

        let reservation = file.lock().reserve().unwrap().unwrap();
        let err = reservation.send(&collector).unwrap_err();
        assert!(matches!(err, Error::Collector(_)));

        assert_eq!(fs::read(file.path()).unwrap(), before);
        assert!(!file.tmp_path().exists());

        // The retry carries the same records, once.
        assert_eq!(drain(&file, &collector).unwrap(), 4);
        assert_eq!(collector.record_count(), 4);
    }

    #[test]
    fn write_after_rename_goes_to_fresh_file() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::History, run());
        write_records(&file, 2);
        let collector = MemoryCollector::new();

        let reservation = file.lock().reserve().unwrap().unwrap();
        file.write_record(&DataRecord::now("\"late\"".to_string()))
            .unwrap();
        assert_eq!(reservation.send(&collector).unwrap(), 2);

        let batch = &collector.batches()[0];
        assert!(batch.records.iter().all(|r| r.payload_json != "\"late\""));
        assert!(file.read_header().is_some());
        assert!(file.has_records());
        let fresh = fs::read_to_string(file.path()).unwrap();
        assert_eq!(fresh.lines().count(), 2);
        assert!(fresh.contains("late"));
    }

    #[test]
    fn failed_submit_merges_with_recreated_file() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::History, run());
        write_records(&file, 2);
        let collector = MemoryCollector::new();
        collector.fail_next_submit("timeout");

        let reservation = file.lock().reserve().unwrap().unwrap();
        file.write_record(&DataRecord::now("\"late\"".to_string()))
            .unwrap();
        assert!(reservation.send(&collector).is_err());

        let content = fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("\"__type\":\"header\""));
        assert!(lines[1].contains("{\\\"i\\\":0}"));
        assert!(lines[3].contains("late"));
        assert!(!file.tmp_path().exists());

        assert_eq!(drain(&file, &collector).unwrap(), 3);
    }

    #[test]
    fn missing_header_is_surfaced_and_data_kept() {
        let dir = tempdir().unwrap();
        let file = RecordFile::detached(dir.path(), FileKind::Log);
        let body = "{\"timestamp\":\"2026-10-19T08:00:00Z\",\"payload_json\":\"1\"}\n";
        fs::write(file.tmp_path(), body).unwrap();
        let collector = MemoryCollector::new();

        let err = drain(&file, &collector).unwrap_err();
        assert!(matches!(err, Error::MissingHeader { .. }));
        assert!(collector.batches().is_empty());
        assert_eq!(fs::read_to_string(file.path()).unwrap(), body);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::Log, run());
        write_records(&file, 1);
        file.write("not json\n").unwrap();
        file.write("{\"timestamp\":\"2026-10-19T08:00:00Z\"}\n").unwrap();
        write_records(&file, 1);
        let collector = MemoryCollector::new();

        assert_eq!(drain(&file, &collector).unwrap(), 2);
        assert!(!file.tmp_path().exists());
    }

    #[test]
    fn torn_multibyte_line_does_not_hide_later_records() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::History, run());
        let mut content = run().header(FileKind::History).to_line().unwrap().into_bytes();
        content.extend_from_slice(b"{\"timestamp\":\"2026-10-19T08:00:00Z\",\"payload_json\":\"\xc3\n");
        fs::write(file.path(), &content).unwrap();
        write_records(&file, 1);
        let collector = MemoryCollector::new();

        assert_eq!(drain(&file, &collector).unwrap(), 1);
        let batches = collector.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records[0].payload_json, "{\"i\":0}");
        assert!(!file.exists());
        assert!(!file.tmp_path().exists());
    }

    #[test]
    fn successful_send_is_silent_at_info() {
        use std::sync::Mutex;
        use tracing_subscriber::prelude::*;

        #[derive(Clone, Default)]
        struct Events(Arc<Mutex<Vec<u8>>>);
        impl Write for Events {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::Log, run());
        write_records(&file, 2);
        let events = Events::default();
        let sink = events.clone();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(move || sink.clone())
                .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
        );

        let sent = tracing::subscriber::with_default(subscriber, || {
            drain(&file, &MemoryCollector::new()).unwrap()
        });
        assert_eq!(sent, 2);
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[test]
    fn header_only_file_is_deleted_without_submit() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::Log, run());
        file.write_header(&run().header(FileKind::Log).to_line().unwrap())
            .unwrap();
        let collector = MemoryCollector::new();
        collector.fail_all_submits(Some("must not be called".to_string()));

        assert_eq!(drain(&file, &collector).unwrap(), 0);
        assert!(!file.exists());
    }

    #[test]
    fn header_only_leftover_tmp_is_deleted_without_submit() {
        let dir = tempdir().unwrap();
        let file = RecordFile::detached(dir.path(), FileKind::History);
        fs::write(
            file.tmp_path(),
            run().header(FileKind::History).to_line().unwrap(),
        )
        .unwrap();
        let collector = MemoryCollector::new();
        collector.fail_all_submits(Some("must not be called".to_string()));

        assert_eq!(drain(&file, &collector).unwrap(), 0);
        assert!(!file.tmp_path().exists());
    }

    #[test]
    fn drain_sends_leftover_then_live() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::Log, run());
        write_records(&file, 2);
        fs::rename(file.path(), file.tmp_path()).unwrap();
        write_records(&file, 3);
        let collector = MemoryCollector::new();

        assert_eq!(drain(&file, &collector).unwrap(), 5);
        let sizes: Vec<usize> = collector.batches().iter().map(|b| b.records.len()).collect();
        assert_eq!(sizes, vec![2, 3]);
        assert!(!file.exists());
        assert!(!file.tmp_path().exists());
    }

    #[test]
    fn young_small_file_is_not_ready() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::History, run());
        write_records(&file, 1);
        let collector = MemoryCollector::new();

        assert_eq!(
            upload_if_ready(&file, &collector, &UploadPolicy::default()).unwrap(),
            0
        );
        assert!(collector.batches().is_empty());
        assert!(file.exists());
    }

    #[test]
    fn oversized_file_is_ready_regardless_of_age() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::History, run());
        write_records(&file, 5);
        let collector = MemoryCollector::new();
        let policy = UploadPolicy {
            max_file_bytes: 64,
            ..UploadPolicy::default()
        };

        assert_eq!(upload_if_ready(&file, &collector, &policy).unwrap(), 5);
    }

    #[test]
    fn leftover_tmp_is_always_ready() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path(), FileKind::History, run());
        write_records(&file, 1);
        fs::rename(file.path(), file.tmp_path()).unwrap();
        let collector = MemoryCollector::new();

        assert_eq!(
            upload_if_ready(&file, &collector, &UploadPolicy::default()).unwrap(),
            1
        );
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn worker_uploads_and_stops() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::open(dir.path(), run()).unwrap());
        write_records(registry.get(FileKind::History), 3);
        let collector = Arc::new(MemoryCollector::new());

        let mut worker =
            UploadWorker::spawn(Arc::clone(&registry), collector.clone(), immediate()).unwrap();
        assert!(wait_for(|| collector.record_count() == 3));
        assert!(worker.stop(Duration::from_secs(5)));
        assert!(!worker.is_running());

        let stats = worker.stats();
        assert!(stats.cycles >= 1);
        assert_eq!(stats.uploads, 1);
        assert_eq!(stats.records, 3);
        assert!(worker.stop(Duration::from_secs(1)));
    }

    #[test]
    fn worker_keeps_data_through_failures() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::open(dir.path(), run()).unwrap());
        write_records(registry.get(FileKind::Log), 2);
        let collector = Arc::new(MemoryCollector::new());
        collector.fail_all_submits(Some("down".to_string()));

        let mut worker =
            UploadWorker::spawn(Arc::clone(&registry), collector.clone(), immediate()).unwrap();
        assert!(wait_for(|| worker.stats().failures >= 2));
        let log = registry.get(FileKind::Log);
        assert!(log.exists() || log.tmp_path().exists());
        assert!(collector.batches().is_empty());

        collector.fail_all_submits(None);
        assert!(wait_for(|| collector.record_count() == 2));
        assert!(worker.stop(Duration::from_secs(5)));
        assert_eq!(collector.batches().len(), 1);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::open(dir.path(), run()).unwrap());
        let policy = UploadPolicy {
            poll_interval_ms: 0,
            ..UploadPolicy::default()
        };
        let err =
            UploadWorker::spawn(registry, Arc::new(MemoryCollector::new()), policy).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
