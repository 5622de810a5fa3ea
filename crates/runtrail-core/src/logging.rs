//! Diagnostic logging for runtrail
//!
//! The agent's own diagnostics go through `tracing`. Binaries embedding the
//! agent call [`init_logging`] once to install a global subscriber writing to
//! stderr and, optionally, to a private log file.
//!
//! ```ignore
//! use runtrail_core::logging::{init_logging, LogConfig, LogFormat};
//!
//! init_logging(&LogConfig {
//!     level: "debug".to_string(),
//!     format: LogFormat::Json,
//!     file: None,
//! })?;
//! ```
//!
//! Events use these field names consistently: `run_id`, `kind`, `path`,
//! `records`, `error`.
//!
//! While console capture is active, stderr is the capture pipe: diagnostic
//! events land in the LOG file as `stderr_output` records and still reach the
//! console. Capture reader threads never log per captured line.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

pub use crate::config::LogFormat;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// `[logging]` section of `runtrail.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default verbosity; directives in `RUST_LOG` take precedence.
    pub level: String,
    pub format: LogFormat,
    /// Also write diagnostics here (created `0o600`, parents `0o700`).
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("cannot open log file: {0}")]
    File(#[from] io::Error),

    #[error("cannot install subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Parse a level name. Accepts `warning` for `warn` and `off`.
pub fn parse_level(raw: &str) -> Result<LevelFilter, LogError> {
    let name = raw.trim().to_ascii_lowercase();
    let name = if name == "warning" { "warn" } else { name.as_str() };
    name.parse::<LevelFilter>()
        .map_err(|_| LogError::InvalidLevel(raw.to_string()))
}

/// Install the global subscriber. Only the first successful call has an
/// effect; later calls return [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(LogError::AlreadyInitialized);
    }
    let installed = install(config);
    if installed.is_err() {
        INSTALLED.store(false, Ordering::Release);
    }
    installed
}

pub fn is_logging_initialized() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

fn install(config: &LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level)?.into())
        .from_env_lossy();
    let file = config.file.as_deref().map(open_private).transpose()?;

    let file_layer = file.map(|file| format_layer(config.format, file, false));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(
            config.format,
            io::stderr,
            io::stderr().is_terminal(),
        ))
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::debug!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Diagnostic logging ready"
    );
    Ok(())
}

/// One output in the chosen format.
fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(ansi);
    match format {
        LogFormat::Pretty => layer.with_thread_names(true).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Open `path` for appending; anything created here is owner-only on unix.
fn open_private(path: &Path) -> io::Result<File> {
    let mut dirs = DirBuilder::new();
    dirs.recursive(true);
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
        dirs.mode(0o700);
        options.mode(0o600);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        dirs.create(parent)?;
    }
    options.open(path)
}
