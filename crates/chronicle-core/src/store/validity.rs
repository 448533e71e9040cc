//! Relationship validity tracker: which relationship is in force for each
//! driving key, as a sequence of non-overlapping intervals.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ChronicleError, ChronicleResult};
use crate::history::{next_transition, ActiveInterval, Transition};
use crate::models::{format_timestamp, to_stored_precision, FixedHash, ValidityInterval};
use crate::store::database::Vault;
use crate::store::registry::{RelationshipDefinition, ValidityDef};
use crate::store::relationship::get_relationship;
use crate::store::{opt_ts_col, ts_col};

const INTERVAL_COLUMNS: &str =
    "id, relationship_key, driving_key, start_time, end_time, is_active";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub relationship_key: FixedHash,
    pub driving_key: FixedHash,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ObservationOutcome {
    Unchanged,
    Opened { seq: i64 },
    Superseded { closed_seq: i64, opened_seq: i64 },
}

/// Resolved tracker definition: the driving role's position among the
/// relationship's participants.
#[derive(Clone, Debug)]
pub(crate) struct TrackerShape {
    pub name: String,
    pub relationship_store: String,
    pub driving_role: String,
    pub driving_position: usize,
}

impl TrackerShape {
    pub(crate) fn resolve(def: &ValidityDef, relationship: &RelationshipDefinition) -> ChronicleResult<Self> {
        let driving_position = relationship
            .participants
            .iter()
            .position(|p| p.role == def.driving_role)
            .ok_or_else(|| {
                ChronicleError::Schema(format!(
                    "'{}' is not a participant role of '{}'",
                    def.driving_role, relationship.name
                ))
            })?;
        Ok(Self {
            name: def.name.clone(),
            relationship_store: def.relationship_store.clone(),
            driving_role: def.driving_role.clone(),
            driving_position,
        })
    }
}

pub struct ValidityTracker<'v> {
    vault: &'v Vault,
    shape: TrackerShape,
}

impl<'v> ValidityTracker<'v> {
    pub(crate) fn new(
        vault: &'v Vault,
        def: ValidityDef,
        relationship: RelationshipDefinition,
    ) -> ChronicleResult<Self> {
        let shape = TrackerShape::resolve(&def, &relationship)?;
        Ok(Self { vault, shape })
    }

    pub fn name(&self) -> &str {
        &self.shape.name
    }

    pub fn driving_role(&self) -> &str {
        &self.shape.driving_role
    }

    /// Record that `relationship_key` was observed for `driving_key`.
    ///
    /// Repeating the active relationship is a no-op; a different one closes
    /// the active interval at `observed_at` and opens a new one. Not seeing a
    /// driving key in a cycle never closes anything.
    pub fn record_observation(
        &self,
        relationship_key: &FixedHash,
        driving_key: &FixedHash,
        observed_at: DateTime<Utc>,
    ) -> ChronicleResult<ObservationOutcome> {
        self.vault.with_tx(|tx| {
            apply_observation(tx, &self.shape, relationship_key, driving_key, observed_at)
        })
    }

    /// Apply a batch in chronological order within one transaction.
    ///
    /// The batch is all-or-nothing: the first failing observation rolls back
    /// every earlier one and its error is returned. Load cycles that need
    /// per-row rejection go through the loader instead.
    pub fn record_observations(&self, observations: &[Observation]) -> ChronicleResult<Vec<ObservationOutcome>> {
        let mut ordered: Vec<&Observation> = observations.iter().collect();
        ordered.sort_by_key(|o| o.observed_at);
        self.vault.with_tx(|tx| {
            ordered
                .into_iter()
                .map(|o| apply_observation(tx, &self.shape, &o.relationship_key, &o.driving_key, o.observed_at))
                .collect()
        })
    }

    /// Every active interval, ordered by driving key.
    pub fn active(&self) -> ChronicleResult<Vec<ValidityInterval>> {
        self.query_intervals("is_active = 1 ORDER BY driving_key", None)
    }

    pub fn active_for(&self, driving_key: &FixedHash) -> ChronicleResult<Option<ValidityInterval>> {
        let rows = self.query_intervals("driving_key = ?2 AND is_active = 1", Some(driving_key))?;
        Ok(rows.into_iter().next())
    }

    /// Every interval of `driving_key`, oldest first.
    pub fn history(&self, driving_key: &FixedHash) -> ChronicleResult<Vec<ValidityInterval>> {
        self.query_intervals("driving_key = ?2 ORDER BY start_time, id", Some(driving_key))
    }

    pub fn count(&self) -> ChronicleResult<i64> {
        self.vault.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM validity_intervals WHERE store = ?1;",
                params![self.shape.name],
                |row| row.get(0),
            )?)
        })
    }

    fn query_intervals(&self, filter: &str, driving_key: Option<&FixedHash>) -> ChronicleResult<Vec<ValidityInterval>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {INTERVAL_COLUMNS} FROM validity_intervals WHERE store = ?1 AND {filter};"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = match driving_key {
                Some(key) => stmt
                    .query_map(params![self.shape.name, key], row_to_interval)?
                    .collect::<Result<Vec<_>, _>>()?,
                None => stmt
                    .query_map(params![self.shape.name], row_to_interval)?
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(rows)
        })
    }
}

fn row_to_interval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidityInterval> {
    Ok(ValidityInterval {
        seq: row.get(0)?,
        relationship_key: row.get(1)?,
        driving_key: row.get(2)?,
        start_time: ts_col(row, 3)?,
        end_time: opt_ts_col(row, 4)?,
        is_active: row.get::<_, i64>(5)? != 0,
    })
}

fn active_interval(conn: &Connection, store: &str, driving_key: &FixedHash) -> ChronicleResult<Option<ActiveInterval>> {
    Ok(conn
        .query_row(
            "SELECT id, relationship_key, start_time FROM validity_intervals \
             WHERE store = ?1 AND driving_key = ?2 AND is_active = 1;",
            params![store, driving_key],
            |row| {
                Ok(ActiveInterval {
                    seq: row.get(0)?,
                    relationship_key: row.get(1)?,
                    start_time: ts_col(row, 2)?,
                })
            },
        )
        .optional()?)
}

fn open_interval(
    conn: &Connection,
    store: &str,
    relationship_key: &FixedHash,
    driving_key: &FixedHash,
    start_time: &DateTime<Utc>,
) -> ChronicleResult<i64> {
    conn.execute(
        "INSERT INTO validity_intervals(store, relationship_key, driving_key, start_time, end_time, is_active) \
         VALUES (?1, ?2, ?3, ?4, NULL, 1);",
        params![store, relationship_key, driving_key, format_timestamp(start_time)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Move the driving key's state machine one step inside the caller's
/// transaction.
pub(crate) fn apply_observation(
    conn: &Connection,
    shape: &TrackerShape,
    relationship_key: &FixedHash,
    driving_key: &FixedHash,
    observed_at: DateTime<Utc>,
) -> ChronicleResult<ObservationOutcome> {
    let observed_at = to_stored_precision(observed_at);
    let relationship = get_relationship(conn, &shape.relationship_store, relationship_key)?
        .ok_or_else(|| {
            ChronicleError::Schema(format!(
                "relationship {relationship_key} is not recorded in '{}'",
                shape.relationship_store
            ))
        })?;
    if relationship.participant_keys.get(shape.driving_position) != Some(driving_key) {
        return Err(ChronicleError::Schema(format!(
            "{driving_key} is not the '{}' participant of relationship {relationship_key}",
            shape.driving_role
        )));
    }

    let active = active_interval(conn, &shape.name, driving_key)?;
    match next_transition(&shape.name, driving_key, active.as_ref(), relationship_key, observed_at)? {
        Transition::Unchanged => Ok(ObservationOutcome::Unchanged),
        Transition::Open {
            relationship_key,
            start_time,
        } => {
            let seq = open_interval(conn, &shape.name, &relationship_key, driving_key, &start_time)?;
            debug!("Opened interval {seq} for {driving_key} in '{}'", shape.name);
            Ok(ObservationOutcome::Opened { seq })
        }
        Transition::Supersede {
            closed_seq,
            closed_relationship_key,
            relationship_key,
            start_time,
        } => {
            conn.execute(
                "UPDATE validity_intervals SET is_active = 0, end_time = ?1 WHERE id = ?2;",
                params![format_timestamp(&start_time), closed_seq],
            )?;
            let opened_seq = open_interval(conn, &shape.name, &relationship_key, driving_key, &start_time)?;
            debug!(
                "Driving key {driving_key} in '{}' moved from {closed_relationship_key} to {relationship_key}",
                shape.name
            );
            Ok(ObservationOutcome::Superseded {
                closed_seq,
                opened_seq,
            })
        }
    }
}
