//! Point-in-time tables: a droppable, rebuildable index from
//! (entity, snapshot date) to the applicable version of each attribute
//! store.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::info;

use crate::config::PitMissingPolicy;
use crate::errors::ChronicleResult;
use crate::history::{pit_digest, project, SnapshotGrid};
use crate::models::{format_date, format_timestamp, FixedHash, PitRow};
use crate::store::attributes::version_points;
use crate::store::database::Vault;
use crate::store::entity::entity_keys;
use crate::store::registry::PitDef;
use crate::store::{date_col, opt_ts_col};

const PIT_COLUMNS: &str =
    "entity_key, snapshot_date, attribute_store, version_key, version_load_time";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PitSummary {
    pub rows: usize,
    pub dates: usize,
    /// SHA-256 of the projection; equal digests mean identical tables.
    pub digest: String,
}

pub struct PitProjector<'v> {
    vault: &'v Vault,
    def: PitDef,
}

fn digest_meta_key(pit: &str) -> String {
    format!("pit_digest:{pit}")
}

impl<'v> PitProjector<'v> {
    pub(crate) fn new(vault: &'v Vault, def: PitDef) -> Self {
        Self { vault, def }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn attribute_stores(&self) -> &[String] {
        &self.def.attribute_stores
    }

    /// Project the current history onto `dates` without persisting anything.
    pub fn compute(&self, dates: &[NaiveDate]) -> ChronicleResult<Vec<PitRow>> {
        let missing = self.vault.config().pit_missing;
        self.vault
            .with_conn(|conn| compute_rows(conn, &self.def, dates, missing))
    }

    /// Drop and rewrite the whole table for `grid` in one transaction.
    pub fn rebuild(&self, grid: &SnapshotGrid) -> ChronicleResult<PitSummary> {
        let dates = grid.dates()?;
        let missing = self.vault.config().pit_missing;
        let summary = self.vault.with_tx(|tx| {
            let rows = compute_rows(tx, &self.def, &dates, missing)?;
            tx.execute("DELETE FROM pit_rows WHERE pit = ?1;", params![self.def.name])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO pit_rows(pit, attribute_store, entity_key, snapshot_date, version_key, version_load_time) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        self.def.name,
                        row.attribute_store,
                        row.entity_key,
                        format_date(&row.snapshot_date),
                        row.applicable_version_key,
                        row.applicable_load_time.as_ref().map(format_timestamp),
                    ])?;
                }
            }
            let digest = pit_digest(&rows);
            tx.execute(
                "INSERT INTO vault_meta(key, value) VALUES(?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![digest_meta_key(&self.def.name), digest],
            )?;
            Ok(PitSummary {
                rows: rows.len(),
                dates: dates.len(),
                digest,
            })
        })?;
        info!(
            "Rebuilt PIT '{}': {} rows over {} dates (digest {})",
            self.def.name, summary.rows, summary.dates, summary.digest
        );
        Ok(summary)
    }

    /// Stored rows in canonical order.
    pub fn rows(&self) -> ChronicleResult<Vec<PitRow>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {PIT_COLUMNS} FROM pit_rows WHERE pit = ?1 \
                 ORDER BY entity_key, snapshot_date, attribute_store;"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![self.def.name], row_to_pit)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Rows for `entity_key` at the latest stored snapshot on or before
    /// `date`, one per attribute store.
    pub fn as_of(&self, entity_key: &FixedHash, date: NaiveDate) -> ChronicleResult<Vec<PitRow>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {PIT_COLUMNS} FROM pit_rows \
                 WHERE pit = ?1 AND entity_key = ?2 AND snapshot_date = (\
                    SELECT MAX(snapshot_date) FROM pit_rows \
                    WHERE pit = ?1 AND entity_key = ?2 AND snapshot_date <= ?3\
                 ) ORDER BY attribute_store;"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![self.def.name, entity_key, format_date(&date)], row_to_pit)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Digest recorded by the last rebuild, if any.
    pub fn stored_digest(&self) -> ChronicleResult<Option<String>> {
        self.vault.get_meta(&digest_meta_key(&self.def.name))
    }
}

fn row_to_pit(row: &rusqlite::Row<'_>) -> rusqlite::Result<PitRow> {
    Ok(PitRow {
        entity_key: row.get(0)?,
        snapshot_date: date_col(row, 1)?,
        attribute_store: row.get(2)?,
        applicable_version_key: row.get(3)?,
        applicable_load_time: opt_ts_col(row, 4)?,
    })
}

fn compute_rows(
    conn: &Connection,
    def: &PitDef,
    dates: &[NaiveDate],
    missing: PitMissingPolicy,
) -> ChronicleResult<Vec<PitRow>> {
    let keys = entity_keys(conn, &def.entity_store)?;
    let mut rows = Vec::new();
    for store in &def.attribute_stores {
        let versions = version_points(conn, store, &keys)?;
        rows.extend(project(store, &keys, &versions, dates, missing));
    }
    rows.sort();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChronicleConfig;
    use crate::hashing::SchemaDescriptor;
    use crate::models::{AttributeTuple, BusinessKey, FieldValue};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, day, 9, 30, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, day).unwrap()
    }

    fn name(value: &str) -> AttributeTuple {
        let mut p = AttributeTuple::new();
        p.insert("name".into(), FieldValue::from(value));
        p
    }

    fn seeded(config: ChronicleConfig) -> (Vault, FixedHash) {
        let v = Vault::open_in_memory(config).unwrap();
        v.register_entity_store("customer").unwrap();
        v.register_attribute_store(
            "customer_details",
            "customer",
            SchemaDescriptor::new("customer_details", 1, ["name"]).unwrap(),
        )
        .unwrap();
        v.register_pit("customer_pit", "customer", &["customer_details"]).unwrap();
        let key = v.entity_store("customer").unwrap().ensure(&BusinessKey::single(1), "crm").unwrap();
        let sat = v.attribute_store("customer_details").unwrap();
        sat.append_if_changed(&key, &name("X"), at(2), "crm").unwrap();
        sat.append_if_changed(&key, &name("Y"), at(6), "crm").unwrap();
        sat.reconcile_all().unwrap();
        (v, key)
    }

    #[test]
    fn rebuild_is_reproducible() {
        let (v, _) = seeded(ChronicleConfig::default());
        let pit = v.pit("customer_pit").unwrap();
        let grid = SnapshotGrid::Daily { start: d(1), end: d(7) };
        let first = pit.rebuild(&grid).unwrap();
        let stored_first = pit.rows().unwrap();
        let second = pit.rebuild(&grid).unwrap();
        assert_eq!(first, second);
        assert_eq!(stored_first, pit.rows().unwrap());
        assert_eq!(first.rows, 7);
        assert_eq!(pit.stored_digest().unwrap(), Some(first.digest.clone()));
        assert_eq!(pit_digest(&pit.rows().unwrap()), first.digest);
    }

    #[test]
    fn projection_picks_the_applicable_version() {
        let (v, key) = seeded(ChronicleConfig::default());
        let pit = v.pit("customer_pit").unwrap();
        pit.rebuild(&SnapshotGrid::explicit([d(1), d(2), d(5), d(6)])).unwrap();
        let sat = v.attribute_store("customer_details").unwrap();
        let history = sat.history(&key).unwrap();

        let rows = pit.rows().unwrap();
        assert_eq!(rows[0].applicable_version_key, None);
        assert_eq!(rows[1].applicable_version_key, Some(history[0].diff_hash.clone()));
        assert_eq!(rows[2].applicable_version_key, Some(history[0].diff_hash.clone()));
        assert_eq!(rows[3].applicable_version_key, Some(history[1].diff_hash.clone()));
        assert_eq!(rows[3].applicable_load_time, Some(at(6)));

        let latest = pit.as_of(&key, d(30)).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].snapshot_date, d(6));
    }

    #[test]
    fn rebuild_reflects_new_history_and_grid() {
        let (v, key) = seeded(ChronicleConfig::default());
        let pit = v.pit("customer_pit").unwrap();
        let before = pit.rebuild(&SnapshotGrid::explicit([d(10)])).unwrap();
        v.attribute_store("customer_details")
            .unwrap()
            .append_if_changed(&key, &name("Z"), at(9), "crm")
            .unwrap();
        let after = pit.rebuild(&SnapshotGrid::explicit([d(10)])).unwrap();
        assert_ne!(before.digest, after.digest);
        assert_eq!(pit.rows().unwrap().len(), 1);
    }

    #[test]
    fn sentinel_missing_policy_and_ghost_entities() {
        let config = ChronicleConfig {
            pit_missing: PitMissingPolicy::Sentinel,
            ..ChronicleConfig::default()
        };
        let (v, key) = seeded(config);
        v.ensure_sentinels("customer").unwrap();
        let pit = v.pit("customer_pit").unwrap();
        let rows = pit.compute(&[d(1)]).unwrap();
        // Real entity plus both sentinels.
        assert_eq!(rows.len(), 3);
        let real = rows.iter().find(|r| r.entity_key == key).unwrap();
        assert_eq!(real.applicable_version_key, Some(FixedHash::unknown()));
        let unknown = rows.iter().find(|r| r.entity_key.is_unknown()).unwrap();
        assert_eq!(unknown.applicable_version_key, Some(FixedHash::unknown()));
    }
}
