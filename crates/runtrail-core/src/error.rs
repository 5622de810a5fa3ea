//! Error types for runtrail-core

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector::CollectorError;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification for errors, used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Missing or invalid parameters, including payloads that cannot be
    /// serialized; raised synchronously, never retried.
    Configuration,
    /// Logger used out of order (double init, log before init).
    Lifecycle,
    /// Submission failed; the data stays on disk for the next poll cycle.
    Transient,
    /// A malformed line or file body. Such lines are skipped with a warning,
    /// so no [`Error`] carries this class today.
    Corruption,
    /// A structural invariant is broken (record file without header row).
    Structural,
    /// OS resource failure (pipes, handles, descriptors, filesystem).
    Resource,
}

/// Main error type for runtrail-core
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid init parameters or configuration
    #[error("Config error: {0}")]
    Config(String),

    /// `init` called while a run is active and `reinit` was not requested
    #[error("logger already initialized; pass reinit to start a new run")]
    AlreadyInitialized,

    /// `log` called before `init`
    #[error("logger not initialized; call init first")]
    NotInitialized,

    /// A record file did not start with a header row
    #[error("record file {} has no header row", path.display())]
    MissingHeader { path: PathBuf },

    /// Another live run holds the working directory
    #[error("working directory {} is owned by a live run", path.display())]
    WorkingDirLocked { path: PathBuf },

    /// Remote collector errors
    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    /// Console capture setup or teardown errors
    #[error("Console capture error: {0}")]
    Capture(String),

    /// Descriptor/handle duplication or redirection errors
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] filedescriptor::Error),

    /// One or more files could not be flushed during `finish`
    #[error("{} file(s) failed to flush: {}", failures.len(), failures.join("; "))]
    Flush { failures: Vec<String> },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable error-class mapping.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) | Self::Json(_) => ErrorClass::Configuration,
            Self::AlreadyInitialized | Self::NotInitialized => ErrorClass::Lifecycle,
            Self::Collector(_) | Self::Flush { .. } => ErrorClass::Transient,
            Self::MissingHeader { .. } => ErrorClass::Structural,
            Self::WorkingDirLocked { .. }
            | Self::Capture(_)
            | Self::Descriptor(_)
            | Self::Io(_) => ErrorClass::Resource,
        }
    }

    /// Whether leaving the data in place and trying again later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Collector(err) => err.is_retryable(),
            Self::Flush { .. } | Self::Io(_) => true,
            _ => false,
        }
    }
}
