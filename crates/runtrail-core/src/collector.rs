//! Remote collector boundary.
//!
//! The agent consumes exactly two operations from the system of record:
//! registering a run and submitting a batch of records for one file kind.
//! [`Collector`] abstracts the transport; three implementations ship here:
//!
//! - [`HttpCollector`] posts JSON to a collector endpoint,
//! - [`SpoolCollector`] writes each call as a JSON document into a local
//!   directory (an offline sink),
//! - [`MemoryCollector`] keeps everything in memory and can be told to fail.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::CollectorConfig;
use crate::record::RecordBatch;
use crate::run::Run;

/// Errors reported by a [`Collector`].
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The request never produced a response (connect, timeout, DNS).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The collector answered with a non-success status.
    #[error("collector returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The sink could not persist the request locally.
    #[error("spool write failed: {0}")]
    Spool(#[from] std::io::Error),

    /// The request could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Injected by [`MemoryCollector`].
    #[error("injected failure: {0}")]
    Injected(String),
}

impl CollectorError {
    /// Whether the same request may succeed later.
    ///
    /// Client errors other than timeouts and rate limiting are permanent.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Spool(_) | Self::Injected(_) => true,
            Self::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            Self::Encode(_) => false,
        }
    }
}

/// Run registration sent once per `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub run_id: String,
    pub name: String,
    pub project: String,
    pub entity: String,
    pub tags: Vec<String>,
    /// Run configuration, serialized as a JSON string.
    pub config_json: String,
    pub created_at: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CreateRunRequest {
    pub fn from_run(run: &Run) -> serde_json::Result<Self> {
        Ok(Self {
            run_id: run.run_id().to_string(),
            name: run.name().to_string(),
            project: run.project().to_string(),
            entity: run.entity().to_string(),
            tags: run.tags().to_vec(),
            config_json: serde_json::to_string(&Value::Object(run.config().clone()))?,
            created_at: run.created_at(),
            description: run.description().map(str::to_string),
            notes: run.notes().map(str::to_string),
        })
    }

    /// Decode `config_json` back into an object; anything else is empty.
    pub fn config(&self) -> Map<String, Value> {
        match serde_json::from_str(&self.config_json) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// The external system of record.
pub trait Collector: Send + Sync {
    fn create_run(&self, request: &CreateRunRequest) -> Result<(), CollectorError>;

    fn submit_record_batch(&self, batch: &RecordBatch) -> Result<(), CollectorError>;
}

/// Collector described by `config`: a spool directory wins over an endpoint.
pub fn from_config(config: &CollectorConfig) -> crate::Result<Arc<dyn Collector>> {
    if let Some(dir) = &config.spool_dir {
        return Ok(Arc::new(SpoolCollector::new(dir.clone())?));
    }
    if let Some(endpoint) = &config.endpoint {
        return Ok(Arc::new(HttpCollector::new(endpoint.clone(), config.timeout())?));
    }
    Err(crate::Error::Config(
        "no collector configured: set collector.endpoint or collector.spool_dir".to_string(),
    ))
}

// =============================================================================
// HTTP
// =============================================================================

/// Posts JSON bodies to a collector endpoint.
///
/// - `POST {endpoint}/v1/runs` for [`CreateRunRequest`]
/// - `POST {endpoint}/v1/runs/{run_id}/records` for [`RecordBatch`]
#[derive(Debug, Clone)]
pub struct HttpCollector {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpCollector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CollectorError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("runtrail/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn runs_url(&self) -> String {
        format!("{}/v1/runs", self.endpoint)
    }

    fn records_url(&self, run_id: &str) -> String {
        format!("{}/v1/runs/{run_id}/records", self.endpoint)
    }

    fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), CollectorError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(CollectorError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl Collector for HttpCollector {
    fn create_run(&self, request: &CreateRunRequest) -> Result<(), CollectorError> {
        self.post(&self.runs_url(), request)
    }

    fn submit_record_batch(&self, batch: &RecordBatch) -> Result<(), CollectorError> {
        self.post(&self.records_url(&batch.run_id), batch)
    }
}

// =============================================================================
// Spool directory
// =============================================================================

/// Writes each call as a pretty JSON document under a spool directory.
///
/// File names: `run-<run_id>.json` and `batch-<run_id>-<kind>-<n>.json`.
/// `n` continues after the highest index already in the spool, and a batch
/// never replaces an existing file.
#[derive(Debug)]
pub struct SpoolCollector {
    dir: PathBuf,
    next_batch: AtomicU64,
}

impl SpoolCollector {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CollectorError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next_batch = next_batch_index(&dir);
        Ok(Self {
            dir,
            next_batch: AtomicU64::new(next_batch),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// One past the highest batch index in `dir`.
fn next_batch_index(dir: &Path) -> u64 {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(std::result::Result::ok)
                .filter_map(|e| batch_index(&e.file_name().to_string_lossy()))
                .max()
                .map_or(0, |n| n + 1)
        })
        .unwrap_or(0)
}

/// `n` from `batch-<run_id>-<kind>-<n>.json`.
fn batch_index(name: &str) -> Option<u64> {
    let stem = name.strip_prefix("batch-")?.strip_suffix(".json")?;
    stem.rsplit_once('-')?.1.parse().ok()
}

/// Publish `bytes` at `path` unless something is already there.
fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, bytes)?;
    let linked = fs::hard_link(&tmp_path, path);
    fs::remove_file(&tmp_path)?;
    linked
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CollectorError> {
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

impl Collector for SpoolCollector {
    fn create_run(&self, request: &CreateRunRequest) -> Result<(), CollectorError> {
        let path = self.dir.join(format!("run-{}.json", request.run_id));
        write_json_atomic(&path, request)
    }

    fn submit_record_batch(&self, batch: &RecordBatch) -> Result<(), CollectorError> {
        let bytes = serde_json::to_vec_pretty(batch)?;
        loop {
            let n = self.next_batch.fetch_add(1, Ordering::Relaxed);
            let path = self
                .dir
                .join(format!("batch-{}-{}-{n}.json", batch.run_id, batch.kind));
            match write_new(&path, &bytes) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    runs: Vec<CreateRunRequest>,
    batches: Vec<RecordBatch>,
    create_failures: VecDeque<String>,
    submit_failures: VecDeque<String>,
    fail_all_submits: Option<String>,
}

/// Records every request in memory.
///
/// Failures are injected per call: queued failures are consumed one per
/// request, and [`MemoryCollector::fail_all_submits`] makes every batch fail
/// until cleared.
#[derive(Debug, Default)]
pub struct MemoryCollector {
    state: Mutex<MemoryState>,
}

impl MemoryCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn runs(&self) -> Vec<CreateRunRequest> {
        self.state().runs.clone()
    }

    pub fn batches(&self) -> Vec<RecordBatch> {
        self.state().batches.clone()
    }

    /// Total records across every accepted batch.
    pub fn record_count(&self) -> usize {
        self.state().batches.iter().map(|b| b.records.len()).sum()
    }

    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.state().create_failures.push_back(message.into());
    }

    pub fn fail_next_submit(&self, message: impl Into<String>) {
        self.state().submit_failures.push_back(message.into());
    }

    /// Fail every batch with `message`; `None` clears the failure.
    pub fn fail_all_submits(&self, message: Option<String>) {
        self.state().fail_all_submits = message;
    }
}

impl Collector for MemoryCollector {
    fn create_run(&self, request: &CreateRunRequest) -> Result<(), CollectorError> {
        let mut state = self.state();
        if let Some(message) = state.create_failures.pop_front() {
            return Err(CollectorError::Injected(message));
        }
        state.runs.push(request.clone());
        Ok(())
    }

    fn submit_record_batch(&self, batch: &RecordBatch) -> Result<(), CollectorError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_all_submits {
            return Err(CollectorError::Injected(message.clone()));
        }
        if let Some(message) = state.submit_failures.pop_front() {
            return Err(CollectorError::Injected(message));
        }
        state.batches.push(batch.clone());
        Ok(())
    }
}
