//! Property-based tests for history sequencing and the record line format.
//!
//! Any interleaving of `log` calls with successful or failed uploads must
//! deliver every history record exactly once, in sequence order.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use runtrail_core::config::UploadPolicy;
use runtrail_core::record::{parse_header_line, parse_record_line};
use runtrail_core::record_file::RecordFile;
use runtrail_core::run::Run;
use runtrail_core::upload::drain;
use runtrail_core::{AgentConfig, DataRecord, FileKind, Logger, MemoryCollector, RunOptions};

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Log,
    Upload { fail: bool },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => Just(Op::Log),
        2 => Just(Op::Upload { fail: false }),
        1 => Just(Op::Upload { fail: true }),
    ]
}

/// Payload text including quotes, escapes and non-ASCII.
fn arb_payload_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 \"\\\\\\n\\t{}é日本🧪]{0,40}"
}

// =============================================================================
// Sequencing across rotations
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn history_is_delivered_once_in_order(ops in prop::collection::vec(arb_op(), 1..40)) {
        let root = TempDir::new().unwrap();
        let collector = Arc::new(MemoryCollector::new());
        let config = AgentConfig {
            temp_root: Some(root.path().to_path_buf()),
            capture_console: false,
            // Keep the background worker idle; uploads are driven below.
            upload: UploadPolicy {
                poll_interval_ms: 3_600_000,
                ..UploadPolicy::default()
            },
            ..AgentConfig::default()
        };
        let logger = Logger::new(config, collector.clone());
        let run_id = logger.init(RunOptions::new("prop")).unwrap();
        let uploader = RecordFile::detached(&logger.workdir().unwrap(), FileKind::History);

        let mut logged = 0u64;
        for op in &ops {
            match op {
                Op::Log => {
                    prop_assert_eq!(logger.log(&json!({ "n": logged })).unwrap(), logged);
                    logged += 1;
                }
                Op::Upload { fail } => {
                    // Only inject when a submit will actually consume it.
                    let inject = *fail && uploader.has_records();
                    if inject {
                        collector.fail_next_submit("flaky");
                    }
                    let result = drain(&uploader, collector.as_ref());
                    prop_assert_eq!(result.is_err(), inject);
                    prop_assert!(!uploader.tmp_path().exists());
                }
            }
        }
        logger.finish().unwrap();

        let delivered: Vec<u64> = collector
            .batches()
            .iter()
            .filter(|b| b.run_id == run_id && b.kind == FileKind::History)
            .flat_map(|b| b.records.iter().filter_map(|r| r.sequence))
            .collect();
        prop_assert_eq!(delivered, (0..logged).collect::<Vec<_>>());
    }
}

// =============================================================================
// Line format
// =============================================================================

proptest! {
    #[test]
    fn data_lines_parse_back(text in arb_payload_text(), sequence in prop::option::of(0u64..1_000_000)) {
        let mut record = DataRecord::now(serde_json::to_string(&text).unwrap());
        record.sequence = sequence;
        let line = record.to_line().unwrap();
        prop_assert!(line.ends_with('\n'));
        prop_assert_eq!(line.matches('\n').count(), 1);
        let parsed = parse_record_line(&line).unwrap();
        prop_assert_eq!(parsed, record);
        prop_assert!(parse_header_line(&line).is_none());
    }

    #[test]
    fn header_lines_are_not_data(run_id in "[a-z0-9]{1,12}", project in "[a-zA-Z0-9_-]{1,20}") {
        let header = Run::new(run_id.clone(), project).header(FileKind::Log);
        let line = header.to_line().unwrap();
        prop_assert!(parse_record_line(&line).is_none());
        let parsed = parse_header_line(&line).unwrap();
        prop_assert_eq!(parsed.run_id, run_id);
        prop_assert_eq!(parsed.kind, Some(FileKind::Log));
    }

    #[test]
    fn parsers_never_panic(line in ".{0,200}") {
        let _ = parse_record_line(&line);
        let _ = parse_header_line(&line);
    }
}
