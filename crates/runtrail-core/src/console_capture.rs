//! Console capture.
//!
//! While a [`ConsoleCapture`] is alive, the process's stdout and stderr are
//! redirected into pipes. One reader thread per stream turns every line
//! into a LOG record and forwards the raw bytes to the original stream, so
//! the console keeps showing everything.
//!
//! Redirection is process-global, so at most one capture is active at a
//! time. The guard restores the original streams on [`ConsoleCapture::stop`]
//! or on drop, whichever comes first.
//!
//! All descriptor work goes through `filedescriptor`, which maps to fd
//! duplication on POSIX and `SetStdHandle` on Windows.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use filedescriptor::{FileDescriptor, Pipe, StdioDescriptor};
use serde_json::json;
use tracing::warn;

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::record::{DataRecord, FileKind};
use crate::registry::FileRegistry;

static CAPTURE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// A captured output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturedStream {
    Stdout,
    Stderr,
}

impl CapturedStream {
    pub const ALL: [CapturedStream; 2] = [CapturedStream::Stdout, CapturedStream::Stderr];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// `payload_name` of records produced from this stream.
    pub const fn payload_name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout_output",
            Self::Stderr => "stderr_output",
        }
    }

    fn descriptor(self) -> StdioDescriptor {
        match self {
            Self::Stdout => StdioDescriptor::Stdout,
            Self::Stderr => StdioDescriptor::Stderr,
        }
    }

    fn flush(self) {
        let _ = match self {
            Self::Stdout => io::stdout().flush(),
            Self::Stderr => io::stderr().flush(),
        };
    }
}

impl fmt::Display for CapturedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of captured lines.
///
/// Called from reader threads. Implementations must not write to stdout or
/// stderr, and must swallow their own failures.
pub trait CaptureSink: Send + Sync {
    fn record_line(&self, stream: CapturedStream, line: &str);
}

/// LOG record for one captured line.
#[must_use]
pub fn capture_record(stream: CapturedStream, line: &str) -> DataRecord {
    let payload = json!({ "stream": stream.as_str(), "data": line });
    let mut record = DataRecord::now(payload.to_string());
    record.payload_name = Some(stream.payload_name().to_string());
    record
}

impl CaptureSink for FileRegistry {
    fn record_line(&self, stream: CapturedStream, line: &str) {
        let _ = self
            .get(FileKind::Log)
            .write_record(&capture_record(stream, line));
    }
}

struct Redirect {
    stream: CapturedStream,
    original: FileDescriptor,
    pipe_write: Option<FileDescriptor>,
}

/// Owned redirection of stdout and stderr.
pub struct ConsoleCapture {
    redirects: Vec<Redirect>,
    readers: Vec<JoinHandle<()>>,
    done_rx: Receiver<()>,
    join_timeout: Duration,
    stopped: bool,
}

impl fmt::Debug for ConsoleCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleCapture")
            .field("streams", &self.redirects.iter().map(|r| r.stream).collect::<Vec<_>>())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl ConsoleCapture {
    /// Redirect both streams into `sink`.
    ///
    /// Fails with [`Error::Capture`] if another capture is active. A failure
    /// part-way restores whatever was already redirected.
    pub fn start(sink: Arc<dyn CaptureSink>, config: &CaptureConfig) -> Result<Self> {
        if CAPTURE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Capture(
                "console capture is already active".to_string(),
            ));
        }

        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let mut capture = Self {
            redirects: Vec::with_capacity(2),
            readers: Vec::with_capacity(2),
            done_rx,
            join_timeout: config.join_timeout(),
            stopped: false,
        };
        let started = CapturedStream::ALL
            .into_iter()
            .try_for_each(|stream| capture.redirect(stream, &sink, &done_tx));
        // Only reader threads may keep the channel open.
        drop(done_tx);
        // On error, dropping `capture` restores the streams and clears the flag.
        started?;
        Ok(capture)
    }

    fn redirect(
        &mut self,
        stream: CapturedStream,
        sink: &Arc<dyn CaptureSink>,
        done_tx: &Sender<()>,
    ) -> Result<()> {
        stream.flush();
        let pipe = Pipe::new()?;
        let original = FileDescriptor::redirect_stdio(&pipe.write, stream.descriptor())?;
        let forward = original.try_clone();
        self.redirects.push(Redirect {
            stream,
            original,
            pipe_write: Some(pipe.write),
        });
        let forward = forward?;

        let reader = pipe.read;
        let sink = Arc::clone(sink);
        let done = done_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("runtrail-capture-{stream}"))
            .spawn(move || {
                let _done = done;
                pump_lines(stream, reader, forward, sink.as_ref());
            })?;
        self.readers.push(handle);
        Ok(())
    }

    pub fn is_active() -> bool {
        CAPTURE_ACTIVE.load(Ordering::Acquire)
    }

    /// Restore the original streams, close the pipes and wait (bounded) for
    /// the reader threads to drain them. Calling it again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let mut first_err = None;
        for redirect in &mut self.redirects {
            redirect.stream.flush();
            match FileDescriptor::redirect_stdio(&redirect.original, redirect.stream.descriptor()) {
                // The returned handle is the pipe's write end that was
                // installed as the stream; dropping it closes it.
                Ok(previous) => drop(previous),
                Err(err) => {
                    first_err.get_or_insert(Error::from(err));
                }
            }
            redirect.pipe_write.take();
        }

        // Every reader holds a sender; all of them gone means all exited.
        match self.done_rx.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                for reader in self.readers.drain(..) {
                    if reader.join().is_err() {
                        warn!("Console capture reader panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "Console capture readers did not finish in time; detaching"
                );
                self.readers.clear();
            }
        }

        CAPTURE_ACTIVE.store(false, Ordering::Release);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ConsoleCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Read `reader` line by line until end of stream. Each non-empty line goes
/// to `sink`; every byte read is forwarded unchanged.
fn pump_lines<R: Read, W: Write>(
    stream: CapturedStream,
    reader: R,
    mut forward: W,
    sink: &dyn CaptureSink,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            sink.record_line(stream, line);
        }
        let _ = forward.write_all(&buf);
        let _ = forward.flush();
    }
}
