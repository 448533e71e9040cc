//! Attribute history store: append-only versioned attribute payloads keyed
//! by entity, with current-flag and end-date maintenance.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use crate::config::TieBreakPolicy;
use crate::errors::{ChronicleError, ChronicleResult};
use crate::hashing::fingerprint::fingerprint_values;
use crate::hashing::{KeyOptions, SchemaDescriptor};
use crate::history::{
    decide_append, plan_current_flags, AppendDecision, KnownVersion, VersionPoint, VersionSlot,
};
use crate::models::{
    format_timestamp, to_stored_precision, AttributeTuple, AttributeVersion, FieldValue, FixedHash,
};
use crate::store::database::Vault;
use crate::store::entity::entity_exists;
use crate::store::registry::AttributeStoreDef;
use crate::store::{json_col, opt_ts_col, ts_col};

const VERSION_COLUMNS: &str = "id, entity_key, diff_hash, load_time, source_tag, is_current, \
                               end_time, payload_json, schema_version";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    Inserted { diff_hash: FixedHash, seq: i64 },
    /// A chronologically adjacent version already has this payload.
    Unchanged { diff_hash: FixedHash },
    /// This exact version was already loaded.
    Replayed { diff_hash: FixedHash },
}

impl AppendOutcome {
    pub fn diff_hash(&self) -> &FixedHash {
        match self {
            AppendOutcome::Inserted { diff_hash, .. }
            | AppendOutcome::Unchanged { diff_hash }
            | AppendOutcome::Replayed { diff_hash } => diff_hash,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, AppendOutcome::Inserted { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub entities: usize,
    pub rows_updated: usize,
}

pub struct AttributeStore<'v> {
    vault: &'v Vault,
    def: AttributeStoreDef,
}

impl<'v> AttributeStore<'v> {
    pub(crate) fn new(vault: &'v Vault, def: AttributeStoreDef) -> Self {
        Self { vault, def }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn entity_store(&self) -> &str {
        &self.def.entity_store
    }

    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.def.descriptor
    }

    /// Fingerprint `payload` the way appends do.
    pub fn fingerprint(&self, payload: &AttributeTuple) -> ChronicleResult<FixedHash> {
        let values = self.def.descriptor.project(payload)?;
        fingerprint_values(&values, &self.vault.config().fingerprint)
    }

    /// Append `payload` as a new version of `entity_key` unless it matches
    /// the version in force at `load_time`.
    ///
    /// New rows are provisionally current; run
    /// [`reconcile_current_flags`](Self::reconcile_current_flags) once the
    /// append phase of the cycle is complete.
    pub fn append_if_changed(
        &self,
        entity_key: &FixedHash,
        payload: &AttributeTuple,
        load_time: DateTime<Utc>,
        source_tag: &str,
    ) -> ChronicleResult<AppendOutcome> {
        let config = self.vault.config();
        self.vault.with_tx(|tx| {
            append_version(
                tx,
                &self.def,
                entity_key,
                payload,
                load_time,
                source_tag,
                config.tie_break,
                &config.fingerprint,
            )
        })
    }

    /// Recompute `is_current` and `end_time` for `entity_keys` in one
    /// transaction. Safe to re-run.
    pub fn reconcile_current_flags(&self, entity_keys: &[FixedHash]) -> ChronicleResult<ReconcileSummary> {
        let policy = self.vault.config().tie_break;
        self.vault
            .with_tx(|tx| reconcile_keys(tx, &self.def.name, Some(entity_keys), policy))
    }

    /// Recompute flags for every entity in the store.
    pub fn reconcile_all(&self) -> ChronicleResult<ReconcileSummary> {
        let policy = self.vault.config().tie_break;
        self.vault
            .with_tx(|tx| reconcile_keys(tx, &self.def.name, None, policy))
    }

    /// All rows flagged current, ordered by entity key.
    pub fn current(&self) -> ChronicleResult<Vec<AttributeVersion>> {
        self.query_versions(
            "is_current = 1 ORDER BY entity_key, load_time, id",
            &[],
        )
    }

    pub fn current_for(&self, entity_key: &FixedHash) -> ChronicleResult<Option<AttributeVersion>> {
        let rows = self.query_versions(
            "entity_key = ?2 AND is_current = 1 ORDER BY load_time DESC, id DESC LIMIT 1",
            &[entity_key.as_str()],
        )?;
        Ok(rows.into_iter().next())
    }

    /// Every version of `entity_key` in chronological order.
    pub fn history(&self, entity_key: &FixedHash) -> ChronicleResult<Vec<AttributeVersion>> {
        self.query_versions(
            "entity_key = ?2 ORDER BY load_time, id",
            &[entity_key.as_str()],
        )
    }

    /// The version of `entity_key` in force at `at`, if any.
    pub fn as_of(&self, entity_key: &FixedHash, at: DateTime<Utc>) -> ChronicleResult<Option<AttributeVersion>> {
        let at = format_timestamp(&at);
        let rows = self.query_versions(
            "entity_key = ?2 AND load_time <= ?3 ORDER BY load_time DESC, id DESC LIMIT 1",
            &[entity_key.as_str(), at.as_str()],
        )?;
        Ok(rows.into_iter().next())
    }

    /// Version timelines for `entity_keys`, keyed by entity.
    pub fn versions_for(&self, entity_keys: &[FixedHash]) -> ChronicleResult<HashMap<FixedHash, Vec<VersionPoint>>> {
        self.vault
            .with_conn(|conn| version_points(conn, &self.def.name, entity_keys))
    }

    pub fn count(&self) -> ChronicleResult<i64> {
        self.vault.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM attribute_versions WHERE store = ?1;",
                params![self.def.name],
                |row| row.get(0),
            )?)
        })
    }

    fn query_versions(&self, filter: &str, extra: &[&str]) -> ChronicleResult<Vec<AttributeVersion>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {VERSION_COLUMNS} FROM attribute_versions WHERE store = ?1 AND {filter};"
            );
            let mut bind: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(extra.len() + 1);
            bind.push(&self.def.name);
            for value in extra {
                bind.push(value);
            }
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(bind.as_slice(), row_to_version)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttributeVersion> {
    Ok(AttributeVersion {
        seq: row.get(0)?,
        entity_key: row.get(1)?,
        diff_hash: row.get(2)?,
        load_time: ts_col(row, 3)?,
        source_tag: row.get(4)?,
        is_current: row.get::<_, i64>(5)? != 0,
        end_time: opt_ts_col(row, 6)?,
        payload: json_col(row, 7)?,
        schema_version: row.get(8)?,
    })
}

fn known_versions(conn: &Connection, store: &str, entity_key: &FixedHash) -> ChronicleResult<Vec<KnownVersion>> {
    let mut stmt = conn.prepare(
        "SELECT id, diff_hash, load_time FROM attribute_versions \
         WHERE store = ?1 AND entity_key = ?2;",
    )?;
    let rows = stmt
        .query_map(params![store, entity_key], |row| {
            Ok(KnownVersion {
                seq: row.get(0)?,
                diff_hash: row.get(1)?,
                load_time: ts_col(row, 2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Append one candidate version inside the caller's transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn append_version(
    conn: &Connection,
    def: &AttributeStoreDef,
    entity_key: &FixedHash,
    payload: &AttributeTuple,
    load_time: DateTime<Utc>,
    source_tag: &str,
    policy: TieBreakPolicy,
    options: &KeyOptions,
) -> ChronicleResult<AppendOutcome> {
    let values = def.descriptor.project(payload)?;
    let diff_hash = fingerprint_values(&values, options)?;
    append_fingerprinted(conn, def, entity_key, values, diff_hash, load_time, source_tag, policy)
}

/// As [`append_version`] for values already projected into descriptor order
/// and fingerprinted.
#[allow(clippy::too_many_arguments)]
pub(crate) fn append_fingerprinted(
    conn: &Connection,
    def: &AttributeStoreDef,
    entity_key: &FixedHash,
    values: Vec<FieldValue>,
    diff_hash: FixedHash,
    load_time: DateTime<Utc>,
    source_tag: &str,
    policy: TieBreakPolicy,
) -> ChronicleResult<AppendOutcome> {
    let load_time = to_stored_precision(load_time);
    if entity_key.is_sentinel() {
        return Err(ChronicleError::ReservedKey(entity_key.to_string()));
    }
    if !entity_exists(conn, &def.entity_store, entity_key)? {
        return Err(ChronicleError::Schema(format!(
            "entity {entity_key} is not registered in '{}'",
            def.entity_store
        )));
    }
    let known = known_versions(conn, &def.name, entity_key)?;

    match decide_append(&def.name, entity_key, &known, &diff_hash, load_time, policy)? {
        AppendDecision::Replay => Ok(AppendOutcome::Replayed { diff_hash }),
        AppendDecision::Unchanged => Ok(AppendOutcome::Unchanged { diff_hash }),
        AppendDecision::Insert => {
            let payload = def.descriptor.to_payload(values);
            conn.execute(
                "INSERT INTO attribute_versions(\
                    store, entity_key, diff_hash, load_time, source_tag, is_current, end_time, \
                    payload_json, schema_version\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 1, NULL, ?6, ?7);",
                params![
                    def.name,
                    entity_key,
                    diff_hash,
                    format_timestamp(&load_time),
                    source_tag,
                    serde_json::to_string(&payload)?,
                    def.descriptor.version,
                ],
            )?;
            let seq = conn.last_insert_rowid();
            debug!("Appended version {seq} of {entity_key} to '{}'", def.name);
            Ok(AppendOutcome::Inserted { diff_hash, seq })
        }
    }
}

/// Insert a sentinel's single ghost version unless it is already present.
pub(crate) fn insert_ghost(
    conn: &Connection,
    def: &AttributeStoreDef,
    sentinel_key: &FixedHash,
    load_time: DateTime<Utc>,
    source_tag: &str,
) -> ChronicleResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO attribute_versions(\
            store, entity_key, diff_hash, load_time, source_tag, is_current, end_time, \
            payload_json, schema_version\
         ) VALUES (?1, ?2, ?2, ?3, ?4, 1, NULL, ?5, ?6);",
        params![
            def.name,
            sentinel_key,
            format_timestamp(&load_time),
            source_tag,
            serde_json::to_string(&def.descriptor.null_payload())?,
            def.descriptor.version,
        ],
    )?;
    Ok(inserted > 0)
}

fn row_to_slot(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionSlot> {
    Ok(VersionSlot {
        seq: row.get(0)?,
        entity_key: row.get(1)?,
        load_time: ts_col(row, 2)?,
        is_current: row.get::<_, i64>(3)? != 0,
        end_time: opt_ts_col(row, 4)?,
    })
}

fn version_slots(conn: &Connection, store: &str, entity_key: Option<&FixedHash>) -> ChronicleResult<Vec<VersionSlot>> {
    let base = "SELECT id, entity_key, load_time, is_current, end_time FROM attribute_versions \
                WHERE store = ?1";
    let slots = match entity_key {
        Some(key) => {
            let mut stmt = conn.prepare(&format!("{base} AND entity_key = ?2;"))?;
            let rows = stmt.query_map(params![store, key], row_to_slot)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!("{base};"))?;
            let rows = stmt.query_map(params![store], row_to_slot)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(slots)
}

/// Plan and apply flag maintenance for `entity_keys` (every entity when
/// `None`) inside the caller's transaction.
pub(crate) fn reconcile_keys(
    conn: &Connection,
    store: &str,
    entity_keys: Option<&[FixedHash]>,
    policy: TieBreakPolicy,
) -> ChronicleResult<ReconcileSummary> {
    let slots = match entity_keys {
        Some(keys) => {
            let mut slots = Vec::new();
            let mut unique: Vec<&FixedHash> = keys.iter().collect();
            unique.sort();
            unique.dedup();
            for key in unique {
                slots.extend(version_slots(conn, store, Some(key))?);
            }
            slots
        }
        None => version_slots(conn, store, None)?,
    };
    let entities = {
        let mut keys: Vec<&FixedHash> = slots.iter().map(|s| &s.entity_key).collect();
        keys.sort();
        keys.dedup();
        keys.len()
    };

    let updates = plan_current_flags(store, &slots, policy)?;
    let mut stmt = conn.prepare(
        "UPDATE attribute_versions SET is_current = ?1, end_time = ?2 WHERE id = ?3;",
    )?;
    for update in &updates {
        let end_time = update.end_time.as_ref().map(format_timestamp);
        stmt.execute(params![update.is_current as i64, end_time, update.seq])?;
    }
    debug!(
        "Reconciled '{store}': {} entities, {} rows updated",
        entities,
        updates.len()
    );
    Ok(ReconcileSummary {
        entities,
        rows_updated: updates.len(),
    })
}

pub(crate) fn version_points(
    conn: &Connection,
    store: &str,
    entity_keys: &[FixedHash],
) -> ChronicleResult<HashMap<FixedHash, Vec<VersionPoint>>> {
    let mut stmt = conn.prepare(
        "SELECT id, diff_hash, load_time FROM attribute_versions \
         WHERE store = ?1 AND entity_key = ?2 ORDER BY load_time, id;",
    )?;
    let mut out = HashMap::with_capacity(entity_keys.len());
    for key in entity_keys {
        if out.contains_key(key) {
            continue;
        }
        let points = stmt
            .query_map(params![store, key], |row| {
                Ok(VersionPoint {
                    seq: row.get(0)?,
                    diff_hash: row.get(1)?,
                    load_time: ts_col(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        out.insert(key.clone(), points);
    }
    Ok(out)
}
