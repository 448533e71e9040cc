//! Per-cycle load reports and their persisted audit trail.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::errors::{ChronicleError, ChronicleResult};
use crate::models::format_timestamp;
use crate::store::database::Vault;
use crate::store::ts_col;

/// A row the cycle refused, with the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub index: usize,
    pub category: String,
    pub message: String,
}

impl RejectedRow {
    pub fn from_error(index: usize, error: &ChronicleError) -> Self {
        Self {
            index,
            category: error.category().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Entity,
    Relationship,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Entity => "entity",
            CycleKind::Relationship => "relationship",
        }
    }
}

/// Outcome of one load cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub cycle_id: String,
    pub kind: CycleKind,
    pub store: String,
    pub source_tag: String,
    pub started_at: DateTime<Utc>,
    pub rows_seen: usize,
    pub entities_created: usize,
    pub versions_inserted: usize,
    pub versions_unchanged: usize,
    pub versions_replayed: usize,
    /// In-batch duplicates of an unchanged payload, collapsed onto the
    /// earliest load time.
    pub collisions_resolved: usize,
    /// Rows whose business key was entirely null.
    pub routed_to_unknown: Vec<usize>,
    pub flags_updated: usize,
    pub relationships_created: usize,
    pub participants_substituted: usize,
    pub intervals_opened: usize,
    pub intervals_closed: usize,
    /// Rows whose driving participant resolved to a sentinel; such rows are
    /// linked but never tracked for validity.
    #[serde(default)]
    pub sentinel_drivers_skipped: usize,
    pub rejected: Vec<RejectedRow>,
    pub elapsed_ms: i64,
}

impl LoadReport {
    pub(crate) fn new(
        cycle_id: String,
        kind: CycleKind,
        store: &str,
        source_tag: &str,
        started_at: DateTime<Utc>,
        rows_seen: usize,
    ) -> Self {
        Self {
            cycle_id,
            kind,
            store: store.to_string(),
            source_tag: source_tag.to_string(),
            started_at,
            rows_seen,
            entities_created: 0,
            versions_inserted: 0,
            versions_unchanged: 0,
            versions_replayed: 0,
            collisions_resolved: 0,
            routed_to_unknown: Vec::new(),
            flags_updated: 0,
            relationships_created: 0,
            participants_substituted: 0,
            intervals_opened: 0,
            intervals_closed: 0,
            sentinel_drivers_skipped: 0,
            rejected: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub(crate) fn reject(&mut self, index: usize, error: &ChronicleError) {
        self.rejected.push(RejectedRow::from_error(index, error));
    }

    pub fn rows_rejected(&self) -> usize {
        self.rejected.len()
    }
}

/// Summary row of a persisted cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub store: String,
    pub kind: String,
    pub source_tag: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_seen: i64,
    pub rows_rejected: i64,
}

pub(crate) fn record_cycle(conn: &Connection, report: &LoadReport, finished_at: DateTime<Utc>) -> ChronicleResult<()> {
    conn.execute(
        "INSERT INTO load_cycles(\
            cycle_id, store, kind, source_tag, started_at, finished_at, rows_seen, rows_rejected, report_json\
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
        params![
            report.cycle_id,
            report.store,
            report.kind.as_str(),
            report.source_tag,
            format_timestamp(&report.started_at),
            format_timestamp(&finished_at),
            report.rows_seen as i64,
            report.rows_rejected() as i64,
            serde_json::to_string(report)?,
        ],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO load_rejections(cycle_id, store, row_index, category, message) \
         VALUES (?1, ?2, ?3, ?4, ?5);",
    )?;
    for row in &report.rejected {
        stmt.execute(params![
            report.cycle_id,
            report.store,
            row.index as i64,
            row.category,
            row.message,
        ])?;
    }
    Ok(())
}

/// Most recent cycles first, optionally for one store.
pub fn recent_cycles(vault: &Vault, store: Option<&str>, limit: Option<i64>) -> ChronicleResult<Vec<CycleRecord>> {
    let effective_limit = std::cmp::max(1, limit.unwrap_or(50));
    let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    let where_sql = match store {
        Some(s) => {
            param_values.push(Box::new(s.to_string()));
            "WHERE store = ?"
        }
        None => "",
    };
    param_values.push(Box::new(effective_limit));
    let sql = format!(
        "SELECT cycle_id, store, kind, source_tag, started_at, finished_at, rows_seen, rows_rejected \
         FROM load_cycles {where_sql} ORDER BY started_at DESC, cycle_id DESC LIMIT ?;"
    );
    vault.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = param_values.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok(CycleRecord {
                    cycle_id: row.get(0)?,
                    store: row.get(1)?,
                    kind: row.get(2)?,
                    source_tag: row.get(3)?,
                    started_at: ts_col(row, 4)?,
                    finished_at: ts_col(row, 5)?,
                    rows_seen: row.get(6)?,
                    rows_rejected: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// The full report persisted for `cycle_id`.
pub fn load_report(vault: &Vault, cycle_id: &str) -> ChronicleResult<Option<LoadReport>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = vault.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT report_json FROM load_cycles WHERE cycle_id = ?1;",
                params![cycle_id],
                |row| row.get(0),
            )
            .optional()?)
    })?;
    raw.map(|json| serde_json::from_str(&json).map_err(ChronicleError::from))
        .transpose()
}

/// Rejections of one cycle in row order.
pub fn rejections(vault: &Vault, cycle_id: &str) -> ChronicleResult<Vec<RejectedRow>> {
    vault.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT row_index, category, message FROM load_rejections \
             WHERE cycle_id = ?1 ORDER BY row_index, id;",
        )?;
        let rows = stmt
            .query_map(params![cycle_id], |row| {
                Ok(RejectedRow {
                    index: row.get::<_, i64>(0)? as usize,
                    category: row.get(1)?,
                    message: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Rejection counts by category, optionally for one store.
pub fn summarize_rejections(vault: &Vault, store: Option<&str>) -> ChronicleResult<IndexMap<String, i64>> {
    let (where_sql, where_params): (&str, Vec<Box<dyn rusqlite::ToSql>>) = match store {
        Some(s) => ("WHERE store = ?1", vec![Box::new(s.to_string()) as Box<dyn rusqlite::ToSql>]),
        None => ("", Vec::new()),
    };
    let sql = format!(
        "SELECT category, COUNT(*) FROM load_rejections {where_sql} \
         GROUP BY category ORDER BY category ASC;"
    );
    vault.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = where_params.iter().map(|b| b.as_ref()).collect();
        let mut out = IndexMap::new();
        let mut rows = stmt.query(param_refs.as_slice())?;
        while let Some(row) = rows.next()? {
            out.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChronicleConfig;
    use chrono::TimeZone;

    fn report(cycle_id: &str, store: &str, day: u32) -> LoadReport {
        let started = Utc.with_ymd_and_hms(2024, 9, day, 0, 0, 0).unwrap();
        let mut r = LoadReport::new(cycle_id.into(), CycleKind::Entity, store, "crm", started, 3);
        r.reject(1, &ChronicleError::KeyDerivation("bad".into()));
        r.reject(2, &ChronicleError::ReservedKey("0".repeat(64)));
        r
    }

    #[test]
    fn cycles_and_rejections_round_trip() {
        let v = Vault::open_in_memory(ChronicleConfig::default()).unwrap();
        let first = report("c1", "customer", 1);
        let second = report("c2", "account", 2);
        v.with_conn(|conn| {
            record_cycle(conn, &first, first.started_at)?;
            record_cycle(conn, &second, second.started_at)
        })
        .unwrap();

        let all = recent_cycles(&v, None, None).unwrap();
        assert_eq!(all.iter().map(|c| c.cycle_id.as_str()).collect::<Vec<_>>(), vec!["c2", "c1"]);
        let customer = recent_cycles(&v, Some("customer"), Some(10)).unwrap();
        assert_eq!(customer.len(), 1);
        assert_eq!(customer[0].rows_rejected, 2);

        assert_eq!(load_report(&v, "c1").unwrap(), Some(first.clone()));
        assert_eq!(rejections(&v, "c1").unwrap(), first.rejected);

        let summary = summarize_rejections(&v, None).unwrap();
        assert_eq!(summary.get("key_derivation"), Some(&2));
        assert_eq!(summary.get("reserved_key"), Some(&2));
        let summary = summarize_rejections(&v, Some("account")).unwrap();
        assert_eq!(summary.values().sum::<i64>(), 2);
    }
}
