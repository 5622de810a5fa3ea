//! Logger: the lifecycle of one run.
//!
//! [`Logger::init`] sets up the working directory, registers the run,
//! starts console capture and the upload worker. [`Logger::log`] appends to
//! the HISTORY file. [`Logger::finish`] stops the worker, then capture, then
//! drains every file itself and tears the run down.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::collector::{Collector, CreateRunRequest};
use crate::config::AgentConfig;
use crate::console_capture::{CaptureSink, ConsoleCapture};
use crate::error::{Error, Result};
use crate::record::{DataRecord, FileKind};
use crate::recovery::{RecoveryReport, recover_orphans};
use crate::registry::FileRegistry;
use crate::run::{Run, generate_run_id};
use crate::upload::{UploadWorker, WorkerStats, drain};

/// Attempts at creating and locking a fresh working directory. A concurrent
/// recovery pass in another process may remove the directory between the
/// two steps.
const WORKDIR_ATTEMPTS: usize = 3;

/// Parameters of [`Logger::init`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub project: String,
    pub entity: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub config: Map<String, Value>,
    /// Finish an active run first instead of failing.
    pub reinit: bool,
    /// Overrides [`AgentConfig::capture_console`].
    pub capture_console: Option<bool>,
}

impl RunOptions {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn reinit(mut self, reinit: bool) -> Self {
        self.reinit = reinit;
        self
    }

    #[must_use]
    pub fn capture_console(mut self, capture: bool) -> Self {
        self.capture_console = Some(capture);
        self
    }
}

struct ActiveRun {
    run: Arc<Run>,
    workdir: PathBuf,
    registry: Arc<FileRegistry>,
    worker: UploadWorker,
    capture: Option<ConsoleCapture>,
    recovery: RecoveryReport,
}

/// Entry point for applications.
pub struct Logger {
    config: AgentConfig,
    collector: Arc<dyn Collector>,
    state: Mutex<Option<ActiveRun>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("run_id", &self.run_id())
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(config: AgentConfig, collector: Arc<dyn Collector>) -> Self {
        Self {
            config,
            collector,
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.state().is_some()
    }

    pub fn run_id(&self) -> Option<String> {
        self.state()
            .as_ref()
            .map(|active| active.run.run_id().to_string())
    }

    pub fn run(&self) -> Option<Arc<Run>> {
        self.state().as_ref().map(|active| Arc::clone(&active.run))
    }

    pub fn workdir(&self) -> Option<PathBuf> {
        self.state().as_ref().map(|active| active.workdir.clone())
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.state().as_ref().map(|active| active.worker.stats())
    }

    /// What startup recovery did during the current run's `init`.
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.state().as_ref().map(|active| active.recovery.clone())
    }

    /// Start a run and return its id.
    ///
    /// Fails with [`Error::AlreadyInitialized`] if a run is active and
    /// `options.reinit` is false. With `reinit`, the active run is finished
    /// first; a failure to flush it is logged, not returned.
    pub fn init(&self, options: RunOptions) -> Result<String> {
        let mut state = self.state();
        if let Some(previous) = state.take() {
            if !options.reinit {
                *state = Some(previous);
                return Err(Error::AlreadyInitialized);
            }
            let run_id = previous.run.run_id().to_string();
            if let Err(err) = self.shutdown(previous) {
                warn!(run_id = %run_id, error = %err, "Previous run did not finish cleanly");
            }
        }

        let active = self.start_run(options)?;
        let run_id = active.run.run_id().to_string();
        info!(
            run_id = %run_id,
            project = %active.run.project(),
            workdir = %active.workdir.display(),
            capture = active.capture.is_some(),
            "Run started"
        );
        *state = Some(active);
        Ok(run_id)
    }

    fn start_run(&self, options: RunOptions) -> Result<ActiveRun> {
        let project = options.project.trim();
        if project.is_empty() {
            return Err(Error::Config("project is required".to_string()));
        }
        self.config.validate()?;

        let run_id = generate_run_id();
        let mut tags = vec![concat!("runtrail/", env!("CARGO_PKG_VERSION")).to_string()];
        if let Some(app_name) = &self.config.app_name {
            tags.push(app_name.clone());
        }
        tags.extend(options.tags);

        let mut run = Run::new(run_id.clone(), project)
            .with_entity(
                options
                    .entity
                    .unwrap_or_else(|| self.config.default_entity.clone()),
            )
            .with_description(options.description)
            .with_notes(options.notes)
            .with_tags(tags)
            .with_config(options.config);
        if let Some(name) = options.name {
            run = run.with_name(name);
        }
        let run = Arc::new(run);

        let workdir = self.config.workdir_for(&run_id);
        let registry = Arc::new(open_workdir(&workdir, &run)?);

        let recovery = recover_orphans(
            &self.config.temp_root(),
            &self.config.dir_prefix,
            Some(&workdir),
            self.collector.as_ref(),
        );

        let setup = || -> Result<(Option<ConsoleCapture>, UploadWorker)> {
            let request = CreateRunRequest::from_run(&run)?;
            self.collector.create_run(&request)?;

            let capture = if options
                .capture_console
                .unwrap_or(self.config.capture_console)
            {
                let sink: Arc<dyn CaptureSink> = registry.clone();
                Some(ConsoleCapture::start(sink, &self.config.capture)?)
            } else {
                None
            };
            let worker = UploadWorker::spawn(
                Arc::clone(&registry),
                Arc::clone(&self.collector),
                self.config.upload,
            )?;
            Ok((capture, worker))
        };

        match setup() {
            Ok((capture, worker)) => Ok(ActiveRun {
                run,
                workdir,
                registry,
                worker,
                capture,
                recovery,
            }),
            Err(err) => {
                drop(registry);
                if let Err(cleanup) = fs::remove_dir_all(&workdir) {
                    warn!(workdir = %workdir.display(), error = %cleanup, "Failed to remove working directory");
                }
                Err(err)
            }
        }
    }

    /// Append `payload` to the HISTORY file and return its sequence number.
    pub fn log<T: Serialize + ?Sized>(&self, payload: &T) -> Result<u64> {
        let state = self.state();
        let Some(active) = state.as_ref() else {
            return Err(Error::NotInitialized);
        };
        let payload_json = serde_json::to_string(payload)?;

        let mut history = active.registry.get(FileKind::History).lock();
        let sequence = active.run.pending_sequence();
        let mut record = DataRecord::now(payload_json);
        record.sequence = Some(sequence);
        record.runtime = Some(active.run.runtime());
        history.write(&record.to_line()?)?;
        active.run.advance_sequence();
        Ok(sequence)
    }

    /// End the run. A no-op when no run is active.
    ///
    /// Run state is torn down even when flushing fails; the failures are
    /// returned as [`Error::Flush`] and the files stay on disk for a later
    /// process's recovery.
    pub fn finish(&self) -> Result<()> {
        let active = self.state().take();
        match active {
            Some(active) => self.shutdown(active),
            None => Ok(()),
        }
    }

    fn shutdown(&self, active: ActiveRun) -> Result<()> {
        let ActiveRun {
            run,
            workdir,
            registry,
            mut worker,
            capture,
            recovery: _,
        } = active;

        // A worker that did not quiesce still holds the upload slot of the
        // file it is sending; `drain` below waits for it.
        worker.stop(self.config.upload.worker_join_timeout());

        let mut failures = Vec::new();
        if let Some(mut capture) = capture {
            if let Err(err) = capture.stop() {
                failures.push(format!("console capture: {err}"));
            }
        }

        let mut records = 0;
        let mut drained = true;
        for file in registry.iter() {
            match drain(file, self.collector.as_ref()) {
                Ok(sent) => records += sent,
                Err(err) => {
                    drained = false;
                    failures.push(format!("{}: {err}", file.kind()));
                }
            }
        }

        drop(registry);
        if drained {
            if let Err(err) = fs::remove_dir_all(&workdir) {
                warn!(workdir = %workdir.display(), error = %err, "Failed to remove working directory");
            }
        }

        if failures.is_empty() {
            info!(run_id = %run.run_id(), records, "Run finished");
            Ok(())
        } else {
            warn!(
                run_id = %run.run_id(),
                workdir = %workdir.display(),
                failures = failures.len(),
                "Run finished with unflushed files"
            );
            Err(Error::Flush { failures })
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(error = %err, "Run did not finish cleanly on drop");
        }
    }
}

fn open_workdir(workdir: &std::path::Path, run: &Arc<Run>) -> Result<FileRegistry> {
    let mut attempt = 1;
    loop {
        fs::create_dir_all(workdir)?;
        match FileRegistry::open(workdir, Arc::clone(run)) {
            Err(Error::Io(err))
                if err.kind() == std::io::ErrorKind::NotFound && attempt < WORKDIR_ATTEMPTS =>
            {
                attempt += 1;
            }
            other => return other,
        }
    }
}
