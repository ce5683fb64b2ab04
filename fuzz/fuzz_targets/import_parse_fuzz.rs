//! Fuzz target for the CSV import parser
//!
//! Feeds arbitrary bytes to `parse_import` and checks the verdict is
//! self-consistent. Rows that come back are then pushed through record
//! validation, which must reject or accept them without panicking.
//!
//! Run with: cargo +nightly fuzz run import_parse_fuzz -- -max_total_time=60

#![no_main]

use catalog_core::{Source, SourceRecord};
use catalog_ops::parse_import;
use libfuzzer_sys::fuzz_target;

const ERROR_CAP: usize = 8;

fuzz_target!(|data: &[u8]| {
    let (validation, rows) = parse_import(data, ERROR_CAP, chrono::Utc::now());

    assert!(validation.errors.len() <= ERROR_CAP);
    assert_eq!(validation.record_count, rows.len() as u64);
    assert_eq!(validation.valid, validation.errors.is_empty());
    if validation.valid {
        assert!(!rows.is_empty(), "a valid file has at least one row");
    }

    let mut last_line = 0;
    for row in &rows {
        assert!(row.line > last_line, "row lines must increase");
        last_line = row.line;
        let _ = SourceRecord::parse(Source::VendorFeed, &row.record);
    }
});
