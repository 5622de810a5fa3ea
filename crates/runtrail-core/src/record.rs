//! On-disk record format.
//!
//! Every record file is newline-delimited JSON. Line 1 is a [`RecordHeader`]
//! carrying the run metadata; every following line is a [`DataRecord`].
//! Lines that fail to parse are skipped by readers, which is how a write torn
//! by a crash is tolerated.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix appended to a live file name while it is reserved for upload.
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// The closed set of record streams a run writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Captured console output.
    Log,
    /// Application payloads passed to `log`.
    History,
}

impl FileKind {
    /// Every kind, in upload order.
    pub const ALL: [FileKind; 2] = [FileKind::Log, FileKind::History];

    /// File name of the live file inside a run's working directory.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Log => "logs.jsonl",
            Self::History => "history.jsonl",
        }
    }

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::History => "history",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "history" => Ok(Self::History),
            _ => Err(format!("unknown file kind: {s}. Expected one of: log, history")),
        }
    }
}

/// Marker value identifying the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMarker {
    Header,
}

/// First line of every record file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    #[serde(rename = "__type")]
    pub marker: HeaderMarker,
    /// Kind of the file this header was written into.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FileKind>,
    pub run_id: String,
    pub project: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub created_at: String,
}

impl RecordHeader {
    /// Serialize as a complete line, newline included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Parse a header line. Returns `None` for anything that is not a
/// well-formed header object.
#[must_use]
pub fn parse_header_line(line: &str) -> Option<RecordHeader> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<RecordHeader>(trimmed).ok()
}

/// One data line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// The payload, serialized as a JSON string.
    pub payload_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Seconds since the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_name: Option<String>,
}

impl DataRecord {
    /// A record stamped with the current time.
    #[must_use]
    pub fn now(payload_json: String) -> Self {
        Self {
            timestamp: timestamp_now(),
            payload_json,
            sequence: None,
            runtime: None,
            payload_name: None,
        }
    }

    /// Serialize as a complete line, newline included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Current time in the record timestamp format.
#[must_use]
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a data line.
///
/// Returns `None` for blank lines, header rows, lines that are not valid
/// JSON, lines missing `timestamp`/`payload_json`, and lines whose timestamp
/// is not RFC 3339.
#[must_use]
pub fn parse_record_line(line: &str) -> Option<DataRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let record: DataRecord = serde_json::from_str(trimmed).ok()?;
    DateTime::parse_from_rfc3339(&record.timestamp).ok()?;
    Some(record)
}

/// A batch submitted to the collector for one run and one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub run_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub records: Vec<DataRecord>,
}
