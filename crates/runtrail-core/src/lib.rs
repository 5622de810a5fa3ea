//! runtrail-core: embedded telemetry agent
//!
//! Records structured events and captured console output during a run,
//! buffers them durably on local disk and ships them to a remote collector
//! in the background.
//!
//! # Architecture
//!
//! ```text
//! log(payload) ──────────────┐
//!                            ▼
//! stdout/stderr ─▶ capture ─▶ RecordFile (history.jsonl / logs.jsonl)
//!                            │  rename-handoff (.tmp)
//!                            ▼
//!                      UploadWorker ─▶ Collector
//! ```
//!
//! # Modules
//!
//! - `run`: run metadata, run ids, the history sequence counter
//! - `record`: on-disk line format (header row, data records, batches)
//! - `record_file`: append-only files that recreate themselves after rotation
//! - `registry`: per-run mapping from file kind to record file, ownership lock
//! - `upload`: reserve/send handoff protocol and the background worker
//! - `recovery`: draining working directories left by earlier processes
//! - `console_capture`: stdout/stderr redirection into the LOG file
//! - `collector`: the remote collector boundary and its implementations
//! - `logger`: `init` / `log` / `finish`
//! - `config`: configuration file and environment overrides
//! - `logging`: diagnostic logging bootstrap
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod collector;
pub mod config;
pub mod console_capture;
pub mod error;
pub mod logger;
pub mod logging;
pub mod record;
pub mod record_file;
pub mod recovery;
pub mod registry;
pub mod run;
pub mod upload;

pub use collector::{
    Collector, CollectorError, CreateRunRequest, HttpCollector, MemoryCollector, SpoolCollector,
};
pub use config::AgentConfig;
pub use error::{Error, ErrorClass, Result};
pub use logger::{Logger, RunOptions};
pub use record::{DataRecord, FileKind, RecordBatch, RecordHeader};

/// Crate version, as injected into every run's tags.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
