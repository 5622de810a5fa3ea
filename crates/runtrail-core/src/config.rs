//! Configuration management for runtrail
//!
//! Handles loading and validation of `runtrail.toml` and the environment
//! overrides applied on top of it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogConfig;

/// Toggle for console capture.
pub const ENV_CAPTURE_LOGS: &str = "RUNTRAIL_CAPTURE_LOGS";
/// Collector endpoint override.
pub const ENV_ENDPOINT: &str = "RUNTRAIL_ENDPOINT";
/// Shared temp root override.
pub const ENV_TEMP_ROOT: &str = "RUNTRAIL_TEMP_ROOT";
/// Explicit config file path.
pub const ENV_CONFIG: &str = "RUNTRAIL_CONFIG";

/// Diagnostic log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding run working directories; OS temp dir when unset
    pub temp_root: Option<PathBuf>,

    /// Working directory name prefix, followed by the run id
    pub dir_prefix: String,

    /// Capture stdout/stderr into the LOG file
    pub capture_console: bool,

    /// Entity used when `init` is not given one
    pub default_entity: String,

    /// Injected as a tag on every run when set
    pub app_name: Option<String>,

    pub upload: UploadPolicy,

    pub capture: CaptureConfig,

    pub collector: CollectorConfig,

    pub logging: LogConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            temp_root: None,
            dir_prefix: default_dir_prefix(),
            capture_console: true,
            default_entity: default_entity(),
            app_name: None,
            upload: UploadPolicy::default(),
            capture: CaptureConfig::default(),
            collector: CollectorConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

fn default_dir_prefix() -> String {
    "runtrail_run_".to_string()
}

fn default_entity() -> String {
    "runtrail".to_string()
}

/// When a record file is handed to the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    /// Upload regardless of age once a file grows past this
    pub max_file_bytes: u64,

    /// Minimum time since the last write before a file with records is uploaded
    pub min_file_age_ms: u64,

    /// Delay between worker cycles
    pub poll_interval_ms: u64,

    /// Delay after a cycle in which any upload failed
    pub error_backoff_ms: u64,

    /// How long `finish` waits for the worker to quiesce
    pub worker_join_timeout_ms: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_file_bytes: 5 * 1024 * 1024,
            min_file_age_ms: 10_000,
            poll_interval_ms: 1_000,
            error_backoff_ms: 5_000,
            worker_join_timeout_ms: 5_000,
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "upload.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_file_age(&self) -> Duration {
        Duration::from_millis(self.min_file_age_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }
}

/// Console capture settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Bound on waiting for reader threads after the pipes close
    pub join_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 1_000,
        }
    }
}

impl CaptureConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Where batches go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Base URL of an HTTP collector
    pub endpoint: Option<String>,

    /// Per-request timeout
    pub timeout_ms: u64,

    /// Write batches to this directory instead of the network
    pub spool_dir: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 10_000,
            spool_dir: None,
        }
    }
}

impl CollectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Interpret a capture toggle value: `true`, `1` or `yes` (any case) enable
/// capture, an unset variable keeps the default, anything else disables it.
#[must_use]
pub fn parse_capture_toggle(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
    }
}

impl AgentConfig {
    /// Load configuration from a specific path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$RUNTRAIL_CONFIG`, else `<config_dir>/runtrail/runtrail.toml`
    /// when it exists, else defaults. Environment overrides are applied.
    pub fn load_default() -> Result<Self> {
        let explicit = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
        let mut config = match explicit.or_else(default_config_path) {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `RUNTRAIL_CAPTURE_LOGS`, `RUNTRAIL_ENDPOINT` and
    /// `RUNTRAIL_TEMP_ROOT` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CAPTURE_LOGS) {
            self.capture_console = parse_capture_toggle(Some(&value));
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|v| !v.trim().is_empty()) {
            self.collector.endpoint = Some(endpoint);
        }
        if let Some(root) = lookup(ENV_TEMP_ROOT).filter(|v| !v.trim().is_empty()) {
            self.temp_root = Some(PathBuf::from(root));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dir_prefix.is_empty() {
            return Err(Error::Config("dir_prefix must not be empty".to_string()));
        }
        if self.dir_prefix.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "dir_prefix must not contain path separators: {}",
                self.dir_prefix
            )));
        }
        crate::logging::parse_level(&self.logging.level)
            .map_err(|e| Error::Config(e.to_string()))?;
        self.upload.validate()
    }

    /// Resolved shared temp root.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Working directory for `run_id`.
    pub fn workdir_for(&self, run_id: &str) -> PathBuf {
        self.temp_root().join(format!("{}{run_id}", self.dir_prefix))
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("runtrail").join("runtrail.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dir_prefix, "runtrail_run_");
        assert_eq!(config.default_entity, "runtrail");
        assert!(config.capture_console);
        assert_eq!(config.upload.max_file_bytes, 5 * 1024 * 1024);
        assert_eq!(config.upload.min_file_age(), Duration::from_secs(10));
        assert_eq!(config.upload.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.upload.error_backoff(), Duration::from_secs(5));
        assert_eq!(config.capture.join_timeout(), Duration::from_secs(1));
        assert_eq!(config.collector.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut config = AgentConfig::default();
        config.logging.level = "chatty".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("chatty")));
        config.logging.level = "WARNING".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AgentConfig::from_toml(
            r#"
            app_name = "trainer"

            [upload]
            min_file_age_ms = 250

            [collector]
            endpoint = "http://collector.local"
            "#,
        )
        .unwrap();
        assert_eq!(config.app_name.as_deref(), Some("trainer"));
        assert_eq!(config.upload.min_file_age_ms, 250);
        assert_eq!(config.upload.poll_interval_ms, 1_000);
        assert_eq!(
            config.collector.endpoint.as_deref(),
            Some("http://collector.local")
        );
        assert_eq!(config.dir_prefix, "runtrail_run_");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = AgentConfig::from_toml("[upload]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bad_prefix_is_rejected() {
        assert!(AgentConfig::from_toml("dir_prefix = \"\"\n").is_err());
        assert!(AgentConfig::from_toml("dir_prefix = \"a/b\"\n").is_err());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = AgentConfig::from_toml("upload = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtrail.toml");
        std::fs::write(&path, "default_entity = \"lab\"\n").unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.default_entity, "lab");
    }

    #[test]
    fn capture_toggle_values() {
        assert!(parse_capture_toggle(None));
        assert!(parse_capture_toggle(Some("true")));
        assert!(parse_capture_toggle(Some("TRUE")));
        assert!(parse_capture_toggle(Some("1")));
        assert!(parse_capture_toggle(Some("Yes")));
        assert!(!parse_capture_toggle(Some("false")));
        assert!(!parse_capture_toggle(Some("0")));
        assert!(!parse_capture_toggle(Some("")));
        assert!(!parse_capture_toggle(Some("on")));
    }

    #[test]
    fn overrides_apply() {
        let env: HashMap<&str, &str> = [
            (ENV_CAPTURE_LOGS, "no"),
            (ENV_ENDPOINT, "http://example.test"),
            (ENV_TEMP_ROOT, "/var/tmp/runs"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| (*v).to_string()));

        assert!(!config.capture_console);
        assert_eq!(
            config.collector.endpoint.as_deref(),
            Some("http://example.test")
        );
        assert_eq!(config.temp_root(), PathBuf::from("/var/tmp/runs"));
    }

    #[test]
    fn empty_overrides_are_ignored() {
        let mut config = AgentConfig::default();
        config.apply_overrides(|key| (key == ENV_ENDPOINT).then(String::new));
        assert!(config.collector.endpoint.is_none());
        assert!(config.capture_console);
    }

    #[test]
    fn workdir_joins_prefix_and_id() {
        let config = AgentConfig {
            temp_root: Some(PathBuf::from("/tmp/root")),
            ..AgentConfig::default()
        };
        assert_eq!(
            config.workdir_for("abc123"),
            PathBuf::from("/tmp/root/runtrail_run_abc123")
        );
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
