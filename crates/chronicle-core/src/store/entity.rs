//! Entity store: the append-only registry of surrogate keys and the
//! business keys they were derived from.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::ChronicleResult;
use crate::hashing::derive_key;
use crate::models::{format_timestamp, to_stored_precision, BusinessKey, EntityRecord, FixedHash};
use crate::store::database::Vault;
use crate::store::registry::EntityStoreDef;
use crate::store::{json_col, ts_col};

const ENTITY_COLUMNS: &str =
    "surrogate_key, business_key_json, first_seen, source_tag, source_table, is_sentinel";

/// Handle on one named entity store. Rows are immutable once written; there
/// is no update or delete.
pub struct EntityStore<'v> {
    vault: &'v Vault,
    def: EntityStoreDef,
}

impl<'v> EntityStore<'v> {
    pub(crate) fn new(vault: &'v Vault, def: EntityStoreDef) -> Self {
        Self { vault, def }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Surrogate key `business_key` maps to, under the vault's key options.
    pub fn derive(&self, business_key: &BusinessKey) -> ChronicleResult<FixedHash> {
        derive_key(business_key, &self.vault.config().business_key)
    }

    /// Insert the entity if it is new and return its surrogate key.
    pub fn ensure(&self, business_key: &BusinessKey, source_tag: &str) -> ChronicleResult<FixedHash> {
        self.ensure_at(business_key, source_tag, Utc::now())
    }

    /// As [`ensure`](Self::ensure), with an explicit `first_seen` clock.
    pub fn ensure_at(
        &self,
        business_key: &BusinessKey,
        source_tag: &str,
        first_seen: DateTime<Utc>,
    ) -> ChronicleResult<FixedHash> {
        let record = EntityRecord {
            surrogate_key: self.derive(business_key)?,
            business_key: business_key.clone(),
            first_seen: to_stored_precision(first_seen),
            source_tag: source_tag.to_string(),
            source_table: business_key.discriminator.clone(),
            is_sentinel: false,
        };
        self.vault
            .with_conn(|conn| insert_entity(conn, &self.def.name, &record))?;
        Ok(record.surrogate_key)
    }

    pub fn get(&self, key: &FixedHash) -> ChronicleResult<Option<EntityRecord>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {ENTITY_COLUMNS} FROM entity_rows WHERE store = ?1 AND surrogate_key = ?2;"
            );
            Ok(conn
                .query_row(&sql, params![self.def.name, key], row_to_entity)
                .optional()?)
        })
    }

    pub fn contains(&self, key: &FixedHash) -> ChronicleResult<bool> {
        self.vault
            .with_conn(|conn| entity_exists(conn, &self.def.name, key))
    }

    /// Every row, sentinels included, ordered by surrogate key.
    pub fn list(&self) -> ChronicleResult<Vec<EntityRecord>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {ENTITY_COLUMNS} FROM entity_rows WHERE store = ?1 ORDER BY surrogate_key;"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![self.def.name], row_to_entity)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count(&self) -> ChronicleResult<i64> {
        self.vault.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM entity_rows WHERE store = ?1;",
                params![self.def.name],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
    Ok(EntityRecord {
        surrogate_key: row.get(0)?,
        business_key: json_col(row, 1)?,
        first_seen: ts_col(row, 2)?,
        source_tag: row.get(3)?,
        source_table: row.get(4)?,
        is_sentinel: row.get::<_, i64>(5)? != 0,
    })
}

/// Insert `record` unless its key already exists. Returns whether a row was
/// written; an existing row keeps its original `first_seen`.
pub(crate) fn insert_entity(
    conn: &Connection,
    store: &str,
    record: &EntityRecord,
) -> ChronicleResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO entity_rows(\
            store, surrogate_key, business_key_json, first_seen, source_tag, source_table, is_sentinel\
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
        params![
            store,
            record.surrogate_key,
            serde_json::to_string(&record.business_key)?,
            format_timestamp(&record.first_seen),
            record.source_tag,
            record.source_table,
            record.is_sentinel as i64,
        ],
    )?;
    if inserted > 0 {
        debug!("New entity {} in '{store}'", record.surrogate_key);
    }
    Ok(inserted > 0)
}

pub(crate) fn entity_exists(conn: &Connection, store: &str, key: &FixedHash) -> ChronicleResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM entity_rows WHERE store = ?1 AND surrogate_key = ?2 LIMIT 1;",
            params![store, key],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// All surrogate keys of `store`, sorted.
pub(crate) fn entity_keys(conn: &Connection, store: &str) -> ChronicleResult<Vec<FixedHash>> {
    let mut stmt =
        conn.prepare("SELECT surrogate_key FROM entity_rows WHERE store = ?1 ORDER BY surrogate_key;")?;
    let keys = stmt
        .query_map(params![store], |row| row.get(0))?
        .collect::<Result<Vec<FixedHash>, _>>()?;
    Ok(keys)
}
