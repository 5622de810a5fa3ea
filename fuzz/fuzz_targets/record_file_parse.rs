#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use runtrail_core::record::{parse_header_line, parse_record_line};
use runtrail_core::record_file::{count_records, has_records};
use runtrail_core::recovery::recover_dir;
use runtrail_core::{FileKind, MemoryCollector};

// Arbitrary bytes as a history file left behind by a crashed process.
fuzz_target!(|data: &[u8]| {
    let mut lines = data.split(|b| *b == b'\n');
    if let Some(first) = lines.next().and_then(|l| std::str::from_utf8(l).ok()) {
        let _ = parse_header_line(first);
    }
    let mut nonblank = 0usize;
    let mut parsed = 0usize;
    for line in lines {
        if line.trim_ascii().is_empty() {
            continue;
        }
        nonblank += 1;
        if std::str::from_utf8(line).is_ok_and(|l| parse_record_line(l).is_some()) {
            parsed += 1;
        }
    }

    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let path = dir.path().join(FileKind::History.file_name());
    if fs::write(&path, data).is_err() {
        return;
    }
    assert_eq!(count_records(&path).ok(), Some(nonblank));
    assert_eq!(has_records(&path), nonblank > 0);

    // Recovery either submits every parseable record and removes the
    // directory, or leaves the file for a later attempt.
    let collector = MemoryCollector::new();
    match recover_dir(dir.path(), &collector) {
        Ok(sent) => {
            assert_eq!(sent, collector.record_count());
            assert_eq!(sent, parsed);
            assert!(!path.exists());
        }
        Err(_) => assert!(collector.batches().is_empty()),
    }
});
