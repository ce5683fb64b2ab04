//! Fuzz target for value normalization
//!
//! Splits the input in two, parses each half as JSON and checks that
//! field equality is reflexive and symmetric.
//!
//! Run with: cargo +nightly fuzz run normalize_fuzz -- -max_total_time=60

#![no_main]

use catalog_staging::values_equal;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let mid = data.len() / 2;
    let (left, right) = data.split_at(mid);
    let (Ok(a), Ok(b)) = (
        serde_json::from_slice::<Value>(left),
        serde_json::from_slice::<Value>(right),
    ) else {
        return;
    };

    assert!(values_equal(&a, &a), "not reflexive: {}", a);
    assert!(values_equal(&b, &b), "not reflexive: {}", b);
    assert_eq!(
        values_equal(&a, &b),
        values_equal(&b, &a),
        "not symmetric: {} vs {}",
        a,
        b
    );
});
