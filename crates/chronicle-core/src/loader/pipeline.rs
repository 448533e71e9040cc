//! Load-cycle orchestration with Rayon-based row preparation.
//!
//! A cycle runs in two phases. The append phase writes new entities,
//! versions, and relationships in one transaction; the maintenance phase
//! then recomputes current flags or validity intervals in a second one.
//! Both phases are idempotent, so a failed cycle is retried by running it
//! again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::{ChronicleConfig, TieBreakPolicy};
use crate::errors::{ChronicleError, ChronicleResult};
use crate::hashing::canonical::sha256_hex;
use crate::hashing::derive_key;
use crate::hashing::fingerprint::fingerprint_values;
use crate::loader::audit::{record_cycle, CycleKind, LoadReport};
use crate::loader::batch::{EntityBatch, EntityRow, RelationshipBatch, RelationshipRow};
use crate::models::{format_timestamp, to_stored_precision, BusinessKey, EntityRecord, FieldValue, FixedHash};
use crate::store::attributes::{append_fingerprinted, reconcile_keys, AppendOutcome};
use crate::store::database::Vault;
use crate::store::entity::insert_entity;
use crate::store::registry::{
    self, AttributeStoreDef, EntityStoreDef, RelationshipDefinition, StoreKind, ValidityDef,
};
use crate::store::relationship::ensure_link;
use crate::store::sentinel::ensure_sentinels_in;
use crate::store::validity::{apply_observation, ObservationOutcome, TrackerShape};

static CYCLE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_cycle_id(kind: CycleKind, store: &str, source_tag: &str, started_at: &DateTime<Utc>) -> String {
    let n = CYCLE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{}|{store}|{source_tag}|{}|{}|{n}",
        kind.as_str(),
        format_timestamp(started_at),
        std::process::id()
    );
    sha256_hex(&seed)[..16].to_string()
}

/// Map `rows` through `worker` on a bounded Rayon pool, preserving order.
fn parallel_prepare<T, R, F>(rows: &[T], workers: usize, worker: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync + Send,
{
    if rows.is_empty() {
        return vec![];
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();

    match pool {
        Ok(pool) => pool.install(|| {
            rows.par_iter()
                .enumerate()
                .map(|(index, row)| worker(index, row))
                .collect()
        }),
        Err(_) => {
            // Fallback to sequential
            rows.iter()
                .enumerate()
                .map(|(index, row)| worker(index, row))
                .collect()
        }
    }
}

/// Run `f` under a savepoint so a row-level failure undoes only that row.
fn in_row_savepoint<T>(conn: &Connection, f: impl FnOnce() -> ChronicleResult<T>) -> ChronicleResult<T> {
    conn.execute_batch("SAVEPOINT chronicle_row;")?;
    match f() {
        Ok(value) => {
            conn.execute_batch("RELEASE SAVEPOINT chronicle_row;")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT chronicle_row;");
            let _ = conn.execute_batch("RELEASE SAVEPOINT chronicle_row;");
            Err(e)
        }
    }
}

/// Resolve a business key to a surrogate, routing all-null keys to the
/// unknown sentinel when configured. The flag reports such routing.
fn resolve_key(business_key: &BusinessKey, config: &ChronicleConfig) -> ChronicleResult<(FixedHash, bool)> {
    if config.route_null_keys_to_unknown && business_key.is_all_null() {
        return Ok((FixedHash::unknown(), true));
    }
    Ok((derive_key(business_key, &config.business_key)?, false))
}

// ---------------------------------------------------------------------------
// Entity cycles
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct PreparedEntity {
    index: usize,
    entity_key: FixedHash,
    routed: bool,
    load_time: DateTime<Utc>,
    /// Projected values and fingerprint, when the batch targets an
    /// attribute store.
    version: Option<(Vec<FieldValue>, FixedHash)>,
}

fn prepare_entity_row(
    index: usize,
    row: &EntityRow,
    attribute_store: Option<&AttributeStoreDef>,
    config: &ChronicleConfig,
) -> ChronicleResult<PreparedEntity> {
    let (entity_key, routed) = resolve_key(&row.business_key, config)?;
    let version = match attribute_store {
        Some(def) => {
            let values = def.descriptor.project(&row.attributes)?;
            let diff_hash = fingerprint_values(&values, &config.fingerprint)?;
            Some((values, diff_hash))
        }
        None if row.attributes.is_empty() => None,
        None => {
            return Err(ChronicleError::Schema(
                "row carries attributes but the batch names no attribute store".to_string(),
            ))
        }
    };
    Ok(PreparedEntity {
        index,
        entity_key,
        routed,
        load_time: to_stored_precision(row.load_time),
        version,
    })
}

/// Reject same-instant conflicts under [`TieBreakPolicy::Reject`] and
/// collapse consecutive duplicates of one payload onto the earliest load
/// time. Returns the surviving rows ordered by entity then time.
fn resolve_collisions(
    store: &str,
    rows: Vec<PreparedEntity>,
    policy: TieBreakPolicy,
    report: &mut LoadReport,
) -> Vec<PreparedEntity> {
    let mut by_entity: BTreeMap<FixedHash, Vec<PreparedEntity>> = BTreeMap::new();
    for row in rows {
        by_entity.entry(row.entity_key.clone()).or_default().push(row);
    }

    let mut survivors = Vec::new();
    for (entity_key, mut group) in by_entity {
        group.sort_by_key(|r| (r.load_time, r.index));
        if group.iter().all(|r| r.version.is_none()) {
            survivors.extend(group);
            continue;
        }

        if policy == TieBreakPolicy::Reject {
            let mut conflicted: Vec<DateTime<Utc>> = Vec::new();
            for pair in group.windows(2) {
                let differs = pair[0].version.as_ref().map(|v| &v.1) != pair[1].version.as_ref().map(|v| &v.1);
                if pair[0].load_time == pair[1].load_time && differs {
                    conflicted.push(pair[0].load_time);
                }
            }
            if !conflicted.is_empty() {
                group.retain(|r| {
                    if conflicted.contains(&r.load_time) {
                        let error = ChronicleError::SimultaneousLoadTime {
                            store: store.to_string(),
                            entity_key: entity_key.to_string(),
                            load_time: r.load_time,
                        };
                        warn!("Row {} rejected: {error}", r.index);
                        report.reject(r.index, &error);
                        false
                    } else {
                        true
                    }
                });
            }
        }

        let mut last_hash: Option<FixedHash> = None;
        for row in group {
            let hash = row.version.as_ref().map(|v| v.1.clone());
            if hash.is_some() && hash == last_hash {
                report.collisions_resolved += 1;
                continue;
            }
            last_hash = hash;
            survivors.push(row);
        }
    }
    survivors
}

/// Run one entity load cycle: register new identities, append changed
/// attribute versions, then recompute current flags for every touched
/// entity.
pub fn run_entity_cycle(vault: &Vault, batch: &EntityBatch) -> ChronicleResult<LoadReport> {
    let started = Instant::now();
    let started_at = Utc::now();
    let config = vault.config().clone();

    let (entity_def, attribute_def) = vault.with_conn(|conn| {
        let entity_def: EntityStoreDef = registry::load(conn, &batch.entity_store, StoreKind::Entity)?;
        let attribute_def = match &batch.attribute_store {
            Some(name) => {
                let def: AttributeStoreDef = registry::load(conn, name, StoreKind::Attribute)?;
                if def.entity_store != entity_def.name {
                    return Err(ChronicleError::Schema(format!(
                        "attribute store '{name}' belongs to '{}', not '{}'",
                        def.entity_store, entity_def.name
                    )));
                }
                Some(def)
            }
            None => None,
        };
        Ok((entity_def, attribute_def))
    })?;
    let target = attribute_def
        .as_ref()
        .map_or(entity_def.name.as_str(), |d| d.name.as_str());

    let cycle_id = new_cycle_id(CycleKind::Entity, target, &batch.source_tag, &started_at);
    let mut report = LoadReport::new(
        cycle_id,
        CycleKind::Entity,
        target,
        &batch.source_tag,
        started_at,
        batch.rows.len(),
    );
    info!(
        "Entity cycle {} on '{}': {} rows from '{}'",
        report.cycle_id,
        target,
        batch.rows.len(),
        batch.source_tag
    );

    // ── prepare ─────────────────────────────────────────────────────────
    let prepared = parallel_prepare(&batch.rows, config.workers, |index, row| {
        prepare_entity_row(index, row, attribute_def.as_ref(), &config)
    });
    let mut candidates = Vec::with_capacity(prepared.len());
    for (index, result) in prepared.into_iter().enumerate() {
        match result {
            Ok(row) => {
                if row.routed {
                    report.routed_to_unknown.push(index);
                }
                candidates.push(row);
            }
            Err(e) => {
                warn!("Row {index} rejected: {e}");
                report.reject(index, &e);
            }
        }
    }
    let (routed, regular): (Vec<PreparedEntity>, Vec<PreparedEntity>) =
        candidates.into_iter().partition(|r| r.routed);
    let survivors = resolve_collisions(target, regular, config.tie_break, &mut report);

    // ── append phase ────────────────────────────────────────────────────
    let touched = vault.with_tx(|tx| {
        if !routed.is_empty() {
            ensure_sentinels_in(tx, &entity_def.name)?;
        }
        let mut touched: Vec<FixedHash> = Vec::new();
        for row in &survivors {
            let business_key = &batch.rows[row.index].business_key;
            let outcome = in_row_savepoint(tx, || {
                let record = EntityRecord {
                    surrogate_key: row.entity_key.clone(),
                    business_key: business_key.clone(),
                    first_seen: row.load_time,
                    source_tag: batch.source_tag.clone(),
                    source_table: business_key.discriminator.clone(),
                    is_sentinel: false,
                };
                let created = insert_entity(tx, &entity_def.name, &record)?;
                let appended = match (&attribute_def, &row.version) {
                    (Some(def), Some((values, diff_hash))) => Some(append_fingerprinted(
                        tx,
                        def,
                        &row.entity_key,
                        values.clone(),
                        diff_hash.clone(),
                        row.load_time,
                        &batch.source_tag,
                        config.tie_break,
                    )?),
                    _ => None,
                };
                Ok((created, appended))
            });
            match outcome {
                Ok((created, appended)) => {
                    if created {
                        report.entities_created += 1;
                    }
                    match appended {
                        Some(AppendOutcome::Inserted { .. }) => {
                            report.versions_inserted += 1;
                            touched.push(row.entity_key.clone());
                        }
                        Some(AppendOutcome::Unchanged { .. }) => report.versions_unchanged += 1,
                        Some(AppendOutcome::Replayed { .. }) => report.versions_replayed += 1,
                        None => {}
                    }
                }
                Err(e) if e.is_row_level() => {
                    warn!("Row {} rejected: {e}", row.index);
                    report.reject(row.index, &e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(touched)
    })?;

    // ── maintenance phase ───────────────────────────────────────────────
    if let Some(def) = &attribute_def {
        if !touched.is_empty() {
            let summary = vault.with_tx(|tx| reconcile_keys(tx, &def.name, Some(&touched), config.tie_break))?;
            report.flags_updated = summary.rows_updated;
        }
    }

    finish(vault, report, started)
}

fn finish(vault: &Vault, mut report: LoadReport, started: Instant) -> ChronicleResult<LoadReport> {
    report.rejected.sort_by_key(|r| r.index);
    report.elapsed_ms = started.elapsed().as_millis() as i64;
    let finished_at = Utc::now();
    vault.with_tx(|tx| record_cycle(tx, &report, finished_at))?;
    info!(
        "Cycle {} on '{}' finished in {} ms: {} rejected, {} entities, {} versions, {} relationships, {} flags updated",
        report.cycle_id,
        report.store,
        report.elapsed_ms,
        report.rows_rejected(),
        report.entities_created,
        report.versions_inserted,
        report.relationships_created,
        report.flags_updated
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Relationship cycles
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct PreparedLink {
    index: usize,
    participant_keys: Vec<FixedHash>,
    routed: bool,
}

fn prepare_link_row(
    index: usize,
    row: &RelationshipRow,
    def: &RelationshipDefinition,
    config: &ChronicleConfig,
) -> ChronicleResult<PreparedLink> {
    if row.participants.len() != def.participants.len() {
        return Err(ChronicleError::Schema(format!(
            "relationship '{}' takes {} participants, row has {}",
            def.name,
            def.participants.len(),
            row.participants.len()
        )));
    }
    let mut participant_keys = Vec::with_capacity(row.participants.len());
    let mut routed = false;
    for business_key in &row.participants {
        let (key, was_routed) = resolve_key(business_key, config)?;
        routed |= was_routed;
        participant_keys.push(key);
    }
    Ok(PreparedLink {
        index,
        participant_keys,
        routed,
    })
}

/// Run one relationship load cycle: append new relationships, then feed
/// the validity tracker one observation per row in time order.
pub fn run_relationship_cycle(vault: &Vault, batch: &RelationshipBatch) -> ChronicleResult<LoadReport> {
    let started = Instant::now();
    let started_at = Utc::now();
    let config = vault.config().clone();

    let (def, tracker) = vault.with_conn(|conn| {
        let def: RelationshipDefinition =
            registry::load(conn, &batch.relationship_store, StoreKind::Relationship)?;
        let tracker = match &batch.validity_tracker {
            Some(name) => {
                let tracker_def: ValidityDef = registry::load(conn, name, StoreKind::Validity)?;
                if tracker_def.relationship_store != def.name {
                    return Err(ChronicleError::Schema(format!(
                        "validity tracker '{name}' follows '{}', not '{}'",
                        tracker_def.relationship_store, def.name
                    )));
                }
                Some(TrackerShape::resolve(&tracker_def, &def)?)
            }
            None => None,
        };
        Ok((def, tracker))
    })?;

    let cycle_id = new_cycle_id(CycleKind::Relationship, &def.name, &batch.source_tag, &started_at);
    let mut report = LoadReport::new(
        cycle_id,
        CycleKind::Relationship,
        &def.name,
        &batch.source_tag,
        started_at,
        batch.rows.len(),
    );
    info!(
        "Relationship cycle {} on '{}': {} rows from '{}'",
        report.cycle_id,
        def.name,
        batch.rows.len(),
        batch.source_tag
    );

    // ── prepare ─────────────────────────────────────────────────────────
    let prepared = parallel_prepare(&batch.rows, config.workers, |index, row| {
        prepare_link_row(index, row, &def, &config)
    });
    let mut candidates = Vec::with_capacity(prepared.len());
    for (index, result) in prepared.into_iter().enumerate() {
        match result {
            Ok(link) => {
                if link.routed {
                    report.routed_to_unknown.push(index);
                }
                candidates.push(link);
            }
            Err(e) => {
                warn!("Row {index} rejected: {e}");
                report.reject(index, &e);
            }
        }
    }

    // ── append phase ────────────────────────────────────────────────────
    let observations = vault.with_tx(|tx| {
        let mut observations: Vec<(DateTime<Utc>, usize, FixedHash, FixedHash)> = Vec::new();
        for link in &candidates {
            let row = &batch.rows[link.index];
            let outcome = in_row_savepoint(tx, || {
                ensure_link(
                    tx,
                    &def,
                    &link.participant_keys,
                    &row.attributes,
                    row.load_time,
                    &batch.source_tag,
                    config.orphan_policy,
                    &config.business_key,
                )
            });
            match outcome {
                Ok(outcome) => {
                    if outcome.inserted {
                        report.relationships_created += 1;
                    }
                    report.participants_substituted += outcome.substituted_roles.len();
                    if let Some(shape) = &tracker {
                        let driving_key = outcome.participant_keys[shape.driving_position].clone();
                        if driving_key.is_sentinel() {
                            report.sentinel_drivers_skipped += 1;
                        } else {
                            observations.push((row.load_time, link.index, outcome.relationship_key, driving_key));
                        }
                    }
                }
                Err(e) if e.is_row_level() => {
                    warn!("Row {} rejected: {e}", link.index);
                    report.reject(link.index, &e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(observations)
    })?;

    // ── maintenance phase ───────────────────────────────────────────────
    if let Some(shape) = &tracker {
        let mut observations = observations;
        observations.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        vault.with_tx(|tx| {
            for (observed_at, index, relationship_key, driving_key) in &observations {
                let outcome = in_row_savepoint(tx, || {
                    apply_observation(tx, shape, relationship_key, driving_key, *observed_at)
                });
                match outcome {
                    Ok(ObservationOutcome::Unchanged) => {}
                    Ok(ObservationOutcome::Opened { .. }) => report.intervals_opened += 1,
                    Ok(ObservationOutcome::Superseded { .. }) => {
                        report.intervals_closed += 1;
                        report.intervals_opened += 1;
                    }
                    Err(e) if e.is_row_level() => {
                        warn!("Row {index} rejected: {e}");
                        report.reject(*index, &e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })?;
    }

    finish(vault, report, started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::SchemaDescriptor;
    use crate::models::AttributeTuple;
    use crate::store::registry::ParticipantDef;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, day, 0, 0, 0).unwrap()
    }

    fn attrs(name: &str) -> AttributeTuple {
        let mut p = AttributeTuple::new();
        p.insert("name".into(), FieldValue::from(name));
        p
    }

    fn vault(config: ChronicleConfig) -> Vault {
        let v = Vault::open_in_memory(config).unwrap();
        v.register_entity_store("customer").unwrap();
        v.register_attribute_store(
            "customer_details",
            "customer",
            SchemaDescriptor::new("customer_details", 1, ["name"]).unwrap(),
        )
        .unwrap();
        v
    }

    fn batch(rows: &[(BusinessKey, &str, u32)]) -> EntityBatch {
        let mut b = EntityBatch::new("customer", "crm").with_attribute_store("customer_details");
        for (key, name, day) in rows {
            b.push(key.clone(), attrs(name), t(*day));
        }
        b
    }

    #[test]
    fn in_batch_duplicates_collapse_to_the_earliest_load_time() {
        let v = vault(ChronicleConfig::default());
        let key = BusinessKey::single(1);
        let report = run_entity_cycle(
            &v,
            &batch(&[(key.clone(), "X", 3), (key.clone(), "X", 1), (key.clone(), "Y", 5)]),
        )
        .unwrap();
        assert_eq!(report.collisions_resolved, 1);
        assert_eq!(report.versions_inserted, 2);
        assert_eq!(report.entities_created, 1);

        let hub = v.entity_store("customer").unwrap();
        let surrogate = hub.derive(&key).unwrap();
        assert_eq!(hub.get(&surrogate).unwrap().unwrap().first_seen, t(1));
        let history = v.attribute_store("customer_details").unwrap().history(&surrogate).unwrap();
        assert_eq!(history[0].load_time, t(1));
        assert_eq!(history[0].end_time, Some(t(5)));
        assert!(history[1].is_current);
    }

    #[test]
    fn same_instant_conflicts_reject_every_involved_row() {
        let v = vault(ChronicleConfig::default());
        let key = BusinessKey::single(1);
        let report = run_entity_cycle(
            &v,
            &batch(&[(key.clone(), "X", 1), (key.clone(), "Y", 1), (BusinessKey::single(2), "Z", 1)]),
        )
        .unwrap();
        assert_eq!(report.rows_rejected(), 2);
        assert!(report.rejected.iter().all(|r| r.category == "simultaneous_load_time"));
        assert_eq!(report.versions_inserted, 1);
    }

    #[test]
    fn null_keys_route_to_unknown_and_bad_rows_are_reported() {
        let v = vault(ChronicleConfig::default());
        let mut b = batch(&[(BusinessKey::new(vec![FieldValue::Null]), "X", 1)]);
        b.push(BusinessKey::new(vec![]), attrs("Y"), t(1));
        b.push(BusinessKey::single(f64::NAN), attrs("Z"), t(1));
        let report = run_entity_cycle(&v, &b).unwrap();
        assert_eq!(report.routed_to_unknown, vec![0]);
        assert_eq!(report.rejected.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 2]);
        let hub = v.entity_store("customer").unwrap();
        assert!(hub.contains(&FixedHash::unknown()).unwrap());
        // Routed rows never write attributes onto the sentinel.
        let sat = v.attribute_store("customer_details").unwrap();
        assert_eq!(sat.history(&FixedHash::unknown()).unwrap().len(), 1);
    }

    #[test]
    fn rerunning_a_cycle_changes_nothing() {
        let v = vault(ChronicleConfig::default());
        let b = batch(&[(BusinessKey::single(1), "X", 1), (BusinessKey::single(1), "Y", 2)]);
        let first = run_entity_cycle(&v, &b).unwrap();
        let second = run_entity_cycle(&v, &b).unwrap();
        assert_eq!(first.versions_inserted, 2);
        assert_eq!(second.versions_inserted, 0);
        assert_eq!(second.versions_replayed, 2);
        assert_eq!(second.flags_updated, 0);
        assert_ne!(first.cycle_id, second.cycle_id);
        assert_eq!(crate::loader::audit::recent_cycles(&v, None, None).unwrap().len(), 2);
    }

    #[test]
    fn mismatched_attribute_store_is_fatal() {
        let v = vault(ChronicleConfig::default());
        v.register_entity_store("supplier").unwrap();
        let b = EntityBatch::new("supplier", "erp").with_attribute_store("customer_details");
        assert!(matches!(run_entity_cycle(&v, &b), Err(ChronicleError::Schema(_))));
    }

    #[test]
    fn relationship_cycle_feeds_the_tracker() {
        let v = vault(ChronicleConfig::default());
        v.register_entity_store("account").unwrap();
        v.register_relationship_store(RelationshipDefinition {
            name: "customer_account".into(),
            participants: vec![
                ParticipantDef::new("customer", "customer"),
                ParticipantDef::new("account", "account"),
            ],
            discriminators: vec![],
        })
        .unwrap();
        v.register_validity_tracker("customer_account_eff", "customer_account", "customer")
            .unwrap();
        let mut accounts = EntityBatch::new("account", "crm");
        accounts.push(BusinessKey::single("A1"), AttributeTuple::new(), t(1));
        accounts.push(BusinessKey::single("A2"), AttributeTuple::new(), t(1));
        run_entity_cycle(&v, &accounts).unwrap();
        run_entity_cycle(&v, &batch(&[(BusinessKey::single(1), "X", 1)])).unwrap();

        let mut links = RelationshipBatch::new("customer_account", "crm").with_validity_tracker("customer_account_eff");
        links.push(vec![BusinessKey::single(1), BusinessKey::single("A2")], vec![], t(4));
        links.push(vec![BusinessKey::single(1), BusinessKey::single("A1")], vec![], t(2));
        links.push(vec![BusinessKey::single(1), BusinessKey::single("NOPE")], vec![], t(3));
        let report = run_relationship_cycle(&v, &links).unwrap();
        assert_eq!(report.relationships_created, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].category, "orphan_relationship");
        assert_eq!(report.intervals_opened, 2);
        assert_eq!(report.intervals_closed, 1);

        let eff = v.validity_tracker("customer_account_eff").unwrap();
        let customer = v.entity_store("customer").unwrap().derive(&BusinessKey::single(1)).unwrap();
        let history = eff.history(&customer).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].end_time, Some(t(4)));
    }

    #[test]
    fn sentinel_drivers_are_linked_but_not_tracked() {
        let config = ChronicleConfig {
            orphan_policy: crate::config::OrphanPolicy::Substitute,
            ..ChronicleConfig::default()
        };
        let v = vault(config);
        v.register_entity_store("account").unwrap();
        v.register_relationship_store(RelationshipDefinition {
            name: "customer_account".into(),
            participants: vec![
                ParticipantDef::new("customer", "customer"),
                ParticipantDef::new("account", "account"),
            ],
            discriminators: vec![],
        })
        .unwrap();
        v.register_validity_tracker("customer_account_eff", "customer_account", "customer")
            .unwrap();
        let mut accounts = EntityBatch::new("account", "crm");
        accounts.push(BusinessKey::single("A1"), AttributeTuple::new(), t(1));
        accounts.push(BusinessKey::single("A2"), AttributeTuple::new(), t(1));
        run_entity_cycle(&v, &accounts).unwrap();

        let nobody = BusinessKey::new(vec![FieldValue::Null]);
        let mut links = RelationshipBatch::new("customer_account", "crm").with_validity_tracker("customer_account_eff");
        links.push(vec![nobody.clone(), BusinessKey::single("A1")], vec![], t(2));
        links.push(vec![nobody, BusinessKey::single("A2")], vec![], t(3));
        links.push(vec![BusinessKey::single(404), BusinessKey::single("A1")], vec![], t(3));
        let report = run_relationship_cycle(&v, &links).unwrap();

        assert_eq!(report.relationships_created, 3);
        assert_eq!(report.participants_substituted, 1);
        assert_eq!(report.sentinel_drivers_skipped, 3);
        assert_eq!(report.intervals_opened, 0);
        assert_eq!(report.intervals_closed, 0);
        let eff = v.validity_tracker("customer_account_eff").unwrap();
        assert!(eff.history(&FixedHash::unknown()).unwrap().is_empty());
        assert!(eff.history(&FixedHash::error()).unwrap().is_empty());
        assert_eq!(eff.count().unwrap(), 0);
    }
}
