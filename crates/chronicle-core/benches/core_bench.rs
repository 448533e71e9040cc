//! Criterion benchmarks for chronicle-core.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init + migration overhead.
//! 2. **key_derivation**: Business-key hashing and attribute fingerprints.
//! 3. **reconcile**: Current-flag planning over synthetic histories.
//! 4. **pit_projection**: Point-in-time projection across snapshot grids.
//! 5. **entity_cycle**: End-to-end entity load cycles on an in-memory vault.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/chronicle-core/Cargo.toml
//! # Run only the reconcile group:
//! cargo bench --manifest-path crates/chronicle-core/Cargo.toml -- reconcile
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use chronicle_core::config::{ChronicleConfig, PitMissingPolicy, TieBreakPolicy};
use chronicle_core::hashing::fingerprint::fingerprint;
use chronicle_core::hashing::{derive_key, KeyOptions, SchemaDescriptor};
use chronicle_core::history::pit::{project, VersionPoint};
use chronicle_core::history::reconcile::{plan_current_flags, VersionSlot};
use chronicle_core::loader::{run_entity_cycle, EntityBatch};
use chronicle_core::models::{AttributeTuple, BusinessKey, FieldValue, FixedHash};
use chronicle_core::store::database::Vault;
use chronicle_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn entity_key(i: usize) -> FixedHash {
    derive_key(&BusinessKey::single(i as i64), &KeyOptions::business_key()).unwrap()
}

fn payload(i: usize, version: usize) -> AttributeTuple {
    let mut p = AttributeTuple::new();
    p.insert("name".into(), FieldValue::Text(format!("customer {i}")));
    p.insert("city".into(), FieldValue::Text(format!("city {}", version % 7)));
    p.insert("score".into(), FieldValue::Int((i * 31 + version) as i64));
    p
}

/// `entities` entities with `versions` versions each, listed newest first so
/// planning has real work to do.
fn synthetic_slots(entities: usize, versions: usize) -> Vec<VersionSlot> {
    let mut slots = Vec::with_capacity(entities * versions);
    let mut seq = 0;
    for e in 0..entities {
        let key = entity_key(e);
        for v in (0..versions).rev() {
            seq += 1;
            slots.push(VersionSlot {
                seq,
                entity_key: key.clone(),
                load_time: base_time() + Duration::days(v as i64),
                is_current: true,
                end_time: None,
            });
        }
    }
    slots
}

fn synthetic_history(entities: usize, versions: usize) -> (Vec<FixedHash>, HashMap<FixedHash, Vec<VersionPoint>>) {
    let mut keys = Vec::with_capacity(entities);
    let mut map = HashMap::with_capacity(entities);
    for e in 0..entities {
        let key = entity_key(e);
        let points = (0..versions)
            .map(|v| VersionPoint {
                seq: (e * versions + v) as i64,
                diff_hash: entity_key(e * 1_000 + v),
                load_time: base_time() + Duration::days((v * 3) as i64),
            })
            .collect();
        keys.push(key.clone());
        map.insert(key, points);
    }
    (keys, map)
}

// ---------------------------------------------------------------------------
// Benchmark: Schema
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema_init_and_migrate", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            for stmt in SCHEMA_STATEMENTS {
                conn.execute_batch(stmt).unwrap();
            }
            migrate_schema(&conn).unwrap();
            black_box(&conn);
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark: Key derivation and fingerprints
// ---------------------------------------------------------------------------

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    let options = KeyOptions::business_key();

    let composite = BusinessKey::new(vec![
        FieldValue::Text("  acme corp ".into()),
        FieldValue::Int(42),
        FieldValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
    ])
    .with_discriminator("crm_customers");

    group.bench_function("single_int", |b| {
        b.iter(|| derive_key(black_box(&BusinessKey::single(1001)), &options).unwrap());
    });
    group.bench_function("composite_with_discriminator", |b| {
        b.iter(|| derive_key(black_box(&composite), &options).unwrap());
    });

    let descriptor = SchemaDescriptor::new("customer_details", 1, ["name", "city", "score"]).unwrap();
    let p = payload(7, 3);
    group.bench_function("fingerprint_three_attributes", |b| {
        b.iter(|| fingerprint(&descriptor, black_box(&p), &KeyOptions::fingerprint()).unwrap());
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Current-flag planning
// ---------------------------------------------------------------------------

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");

    for &(entities, versions) in &[(100, 5), (1_000, 5), (1_000, 50)] {
        let slots = synthetic_slots(entities, versions);
        group.bench_with_input(
            BenchmarkId::new("plan", format!("{entities}x{versions}")),
            &slots,
            |b, slots| {
                b.iter(|| plan_current_flags("bench", black_box(slots), TieBreakPolicy::Reject).unwrap());
            },
        );
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: PIT projection
// ---------------------------------------------------------------------------

fn bench_pit_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("pit_projection");
    let (keys, history) = synthetic_history(1_000, 20);

    for &days in &[7u32, 90, 365] {
        let dates: Vec<NaiveDate> = (0..days)
            .map(|d| base_time().date_naive() + Duration::days(i64::from(d)))
            .collect();
        group.bench_with_input(BenchmarkId::new("daily", days), &dates, |b, dates| {
            b.iter(|| {
                let rows = project("bench", &keys, &history, black_box(dates), PitMissingPolicy::Null);
                black_box(rows.len());
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: End-to-end entity cycles
// ---------------------------------------------------------------------------

fn setup_vault() -> Vault {
    let vault = Vault::open_in_memory(ChronicleConfig::default()).unwrap();
    vault.register_entity_store("customer").unwrap();
    vault
        .register_attribute_store(
            "customer_details",
            "customer",
            SchemaDescriptor::new("customer_details", 1, ["name", "city", "score"]).unwrap(),
        )
        .unwrap();
    vault
}

fn entity_batch(rows: usize, version: usize) -> EntityBatch {
    let mut batch = EntityBatch::new("customer", "bench").with_attribute_store("customer_details");
    let load_time = base_time() + Duration::days(version as i64);
    for i in 0..rows {
        batch.push(BusinessKey::single(i as i64), payload(i, version), load_time);
    }
    batch
}

fn bench_entity_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_cycle");
    group.sample_size(20);

    for &rows in &[100usize, 1_000] {
        let first = entity_batch(rows, 0);
        let second = entity_batch(rows, 1);
        group.bench_with_input(BenchmarkId::new("initial_then_delta", rows), &rows, |b, _| {
            b.iter_with_setup(setup_vault, |vault| {
                run_entity_cycle(&vault, &first).unwrap();
                let report = run_entity_cycle(&vault, &second).unwrap();
                black_box(report.versions_inserted);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_schema_init,
    bench_key_derivation,
    bench_reconcile,
    bench_pit_projection,
    bench_entity_cycle,
);
criterion_main!(benches);
