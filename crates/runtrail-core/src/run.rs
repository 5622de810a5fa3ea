//! Run metadata.
//!
//! A [`Run`] is immutable once built; the only mutable state is the history
//! sequence counter, which advances once per successfully written `log`
//! record and is never reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde_json::{Map, Value};

use crate::record::{FileKind, HeaderMarker, RecordHeader};

const RUN_ID_SUFFIX_LEN: usize = 3;
const RUN_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode `value` in lowercase base 36.
#[must_use]
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        let digit = (value % 36) as usize;
        digits.push(RUN_ID_ALPHABET[digit]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Generate a run id: epoch seconds in base 36 followed by three random
/// `[a-z0-9]` characters.
#[must_use]
pub fn generate_run_id() -> String {
    let epoch_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    run_id_at(epoch_secs, &mut rand::rng())
}

fn run_id_at<R: Rng>(epoch_secs: u64, rng: &mut R) -> String {
    let mut id = to_base36(epoch_secs);
    for _ in 0..RUN_ID_SUFFIX_LEN {
        let idx = rng.random_range(0..RUN_ID_ALPHABET.len());
        id.push(char::from(RUN_ID_ALPHABET[idx]));
    }
    id
}

/// One logging session.
#[derive(Debug)]
pub struct Run {
    run_id: String,
    project: String,
    entity: String,
    name: String,
    description: Option<String>,
    notes: Option<String>,
    tags: Vec<String>,
    config: Map<String, Value>,
    start_time: DateTime<Utc>,
    started: Instant,
    sequence: AtomicU64,
}

impl Run {
    /// Create a run with empty metadata; `name` defaults to `run-<run_id>`.
    #[must_use]
    pub fn new(run_id: impl Into<String>, project: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            name: format!("run-{run_id}"),
            run_id,
            project: project.into(),
            entity: String::new(),
            description: None,
            notes: None,
            tags: Vec::new(),
            config: Map::new(),
            start_time: Utc::now(),
            started: Instant::now(),
            sequence: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = entity.into();
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// `start_time` in the record timestamp format.
    pub fn created_at(&self) -> String {
        self.start_time
            .to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Seconds elapsed since the run started, recomputed on every call.
    pub fn runtime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Sequence number the next history record will carry.
    ///
    /// Callers read this while holding the history file lock and call
    /// [`Run::advance_sequence`] only after the record is on disk.
    pub fn pending_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn advance_sequence(&self) {
        self.sequence.fetch_add(1, Ordering::AcqRel);
    }

    /// Header row for a file of `kind`.
    #[must_use]
    pub fn header(&self, kind: FileKind) -> RecordHeader {
        RecordHeader {
            marker: HeaderMarker::Header,
            kind: Some(kind),
            run_id: self.run_id.clone(),
            project: self.project.clone(),
            entity: self.entity.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            notes: self.notes.clone(),
            tags: self.tags.clone(),
            config: self.config.clone(),
            created_at: self.created_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn base36_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(9), "9");
        assert_eq!(to_base36(10), "a");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000), "s44we8");
    }

    #[test]
    fn run_id_is_epoch_prefix_plus_suffix() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = run_id_at(1_700_000_000, &mut rng);
        assert!(id.starts_with("s44we8"));
        assert_eq!(id.len(), "s44we8".len() + RUN_ID_SUFFIX_LEN);
        assert!(
            id.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        );
    }

    #[test]
    fn run_ids_sort_by_time() {
        let mut rng = StdRng::seed_from_u64(1);
        let earlier = run_id_at(1_700_000_000, &mut rng);
        let later = run_id_at(1_700_000_100, &mut rng);
        assert!(earlier[..6] < later[..6]);
    }

    #[test]
    fn generated_ids_are_unique_enough() {
        let ids: std::collections::HashSet<String> = (0..20).map(|_| generate_run_id()).collect();
        assert!(ids.len() > 1);
    }

    #[test]
    fn default_name_derives_from_id() {
        let run = Run::new("abc123", "proj");
        assert_eq!(run.name(), "run-abc123");
        assert_eq!(run.project(), "proj");
        assert!(run.tags().is_empty());
    }

    #[test]
    fn sequence_advances_only_on_commit() {
        let run = Run::new("abc123", "proj");
        assert_eq!(run.pending_sequence(), 0);
        run.advance_sequence();
        run.advance_sequence();
        assert_eq!(run.pending_sequence(), 2);
    }

    #[test]
    fn runtime_is_monotonic() {
        let run = Run::new("abc123", "proj");
        let first = run.runtime();
        let second = run.runtime();
        assert!(second >= first);
        assert!(first >= 0.0);
    }

    #[test]
    fn header_copies_metadata() {
        let mut config = Map::new();
        config.insert("lr".to_string(), Value::from(0.01));
        let run = Run::new("abc123", "proj")
            .with_entity("team")
            .with_tags(vec!["runtrail/0.1.0".to_string(), "exp".to_string()])
            .with_notes(Some("n".to_string()))
            .with_config(config);
        let header = run.header(FileKind::Log);
        assert_eq!(header.kind, Some(FileKind::Log));
        assert_eq!(header.run_id, "abc123");
        assert_eq!(header.entity, "team");
        assert_eq!(header.tags, vec!["runtrail/0.1.0", "exp"]);
        assert_eq!(header.notes.as_deref(), Some("n"));
        assert_eq!(header.config["lr"], Value::from(0.01));
        assert_eq!(header.created_at, run.created_at());
    }
}
