use catalog_core::{ProductSnapshot, Source, SourceRecord};
use catalog_staging::{diff_record, values_equal};
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn snapshot() -> ProductSnapshot {
    let now = Utc::now();
    let mut snapshot = ProductSnapshot::new("X1", now);
    for (field, value) in [
        ("price", json!(10.0)),
        ("compare_at_price", json!(12.0)),
        ("inventory", json!(40)),
        ("title", json!("Ceramic Mug")),
        ("vendor", json!("Acme")),
        ("tags", json!(["kitchen", "mug"])),
        ("attributes", json!({"color": "blue", "size": "M"})),
    ] {
        snapshot.apply_synced(field, value, Source::Internal, now);
    }
    snapshot
}

fn bench_diff(c: &mut Criterion) {
    let snapshot = snapshot();
    let unchanged = SourceRecord::parse(
        Source::VendorFeed,
        &json!({
            "sku": "X1", "price": "10.00", "compare_at_price": 12, "inventory": 40,
            "title": " Ceramic Mug ", "vendor": "Acme", "tags": ["kitchen", "mug"],
            "attributes": {"color": "blue", "size": "M", "material": ""}
        }),
    )
    .expect("valid record");
    let changed = SourceRecord::parse(
        Source::VendorFeed,
        &json!({"sku": "X1", "price": 11.5, "inventory": 38, "title": "Mug"}),
    )
    .expect("valid record");

    c.bench_function("diff/unchanged_record", |b| {
        b.iter(|| black_box(diff_record(black_box(&unchanged), Some(&snapshot)).len()));
    });
    c.bench_function("diff/changed_record", |b| {
        b.iter(|| black_box(diff_record(black_box(&changed), Some(&snapshot)).len()));
    });
}

fn bench_normalize(c: &mut Criterion) {
    let a = json!({"color": " blue", "sizes": ["S", "M", "L"], "weight": "1.25"});
    let b = json!({"color": "blue", "sizes": ["S", "M", "L"], "weight": 1.25, "note": null});
    c.bench_function("normalize/values_equal_object", |bench| {
        bench.iter(|| black_box(values_equal(black_box(&a), black_box(&b))));
    });
}

criterion_group!(benches, bench_diff, bench_normalize);
criterion_main!(benches);
