//! Relationship store: append-only associations between two or more
//! entities, keyed by the hash of their ordered participant keys.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::OrphanPolicy;
use crate::errors::{ChronicleError, ChronicleResult};
use crate::hashing::{derive_relationship_key, KeyOptions};
use crate::models::{format_timestamp, to_stored_precision, FieldValue, FixedHash, RelationshipRecord};
use crate::store::database::Vault;
use crate::store::entity::entity_exists;
use crate::store::registry::RelationshipDefinition;
use crate::store::sentinel::ensure_sentinels_in;
use crate::store::{json_col, ts_col};

const RELATIONSHIP_COLUMNS: &str =
    "relationship_key, participants_json, attributes_json, load_time, source_tag";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub relationship_key: FixedHash,
    /// Participant keys as stored, after any orphan substitution.
    pub participant_keys: Vec<FixedHash>,
    pub inserted: bool,
    /// Roles whose key was replaced by the error sentinel.
    pub substituted_roles: Vec<String>,
}

pub struct RelationshipStore<'v> {
    vault: &'v Vault,
    def: RelationshipDefinition,
}

impl<'v> RelationshipStore<'v> {
    pub(crate) fn new(vault: &'v Vault, def: RelationshipDefinition) -> Self {
        Self { vault, def }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &RelationshipDefinition {
        &self.def
    }

    /// Relationship key for `participant_keys` (in definition order) and the
    /// discriminator values.
    pub fn derive(&self, participant_keys: &[FixedHash], attributes: &[FieldValue]) -> ChronicleResult<FixedHash> {
        check_shape(&self.def, participant_keys, attributes)?;
        derive_relationship_key(participant_keys, attributes, &self.vault.config().business_key)
    }

    pub fn ensure(
        &self,
        participant_keys: &[FixedHash],
        attributes: &[FieldValue],
        source_tag: &str,
    ) -> ChronicleResult<FixedHash> {
        self.ensure_at(participant_keys, attributes, source_tag, Utc::now())
    }

    /// Insert the relationship if it is new and return its key, applying the
    /// vault's orphan policy.
    pub fn ensure_at(
        &self,
        participant_keys: &[FixedHash],
        attributes: &[FieldValue],
        source_tag: &str,
        load_time: DateTime<Utc>,
    ) -> ChronicleResult<FixedHash> {
        let policy = self.vault.config().orphan_policy;
        let outcome = self.ensure_with_policy(participant_keys, attributes, source_tag, load_time, policy)?;
        Ok(outcome.relationship_key)
    }

    pub fn ensure_with_policy(
        &self,
        participant_keys: &[FixedHash],
        attributes: &[FieldValue],
        source_tag: &str,
        load_time: DateTime<Utc>,
        policy: OrphanPolicy,
    ) -> ChronicleResult<LinkOutcome> {
        let options = self.vault.config().business_key;
        self.vault.with_tx(|tx| {
            ensure_link(
                tx,
                &self.def,
                participant_keys,
                attributes,
                load_time,
                source_tag,
                policy,
                &options,
            )
        })
    }

    pub fn get(&self, relationship_key: &FixedHash) -> ChronicleResult<Option<RelationshipRecord>> {
        self.vault.with_conn(|conn| get_relationship(conn, &self.def.name, relationship_key))
    }

    pub fn list(&self) -> ChronicleResult<Vec<RelationshipRecord>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {RELATIONSHIP_COLUMNS} FROM relationship_rows \
                 WHERE store = ?1 ORDER BY relationship_key;"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![self.def.name], row_to_relationship)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Relationships in which `entity_key` takes part, in any role.
    pub fn for_participant(&self, entity_key: &FixedHash) -> ChronicleResult<Vec<RelationshipRecord>> {
        self.vault.with_conn(|conn| {
            let sql = format!(
                "SELECT {RELATIONSHIP_COLUMNS} FROM relationship_rows r \
                 WHERE r.store = ?1 AND r.relationship_key IN (\
                    SELECT p.relationship_key FROM relationship_participants p \
                    WHERE p.store = ?1 AND p.entity_key = ?2\
                 ) ORDER BY r.relationship_key;"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![self.def.name, entity_key], row_to_relationship)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count(&self) -> ChronicleResult<i64> {
        self.vault.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM relationship_rows WHERE store = ?1;",
                params![self.def.name],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationshipRecord> {
    Ok(RelationshipRecord {
        relationship_key: row.get(0)?,
        participant_keys: json_col(row, 1)?,
        attributes: json_col(row, 2)?,
        load_time: ts_col(row, 3)?,
        source_tag: row.get(4)?,
    })
}

pub(crate) fn get_relationship(
    conn: &Connection,
    store: &str,
    relationship_key: &FixedHash,
) -> ChronicleResult<Option<RelationshipRecord>> {
    let sql = format!(
        "SELECT {RELATIONSHIP_COLUMNS} FROM relationship_rows \
         WHERE store = ?1 AND relationship_key = ?2;"
    );
    Ok(conn
        .query_row(&sql, params![store, relationship_key], row_to_relationship)
        .optional()?)
}

fn check_shape(
    def: &RelationshipDefinition,
    participant_keys: &[FixedHash],
    attributes: &[FieldValue],
) -> ChronicleResult<()> {
    if participant_keys.len() != def.participants.len() {
        return Err(ChronicleError::Schema(format!(
            "relationship '{}' takes {} participants, got {}",
            def.name,
            def.participants.len(),
            participant_keys.len()
        )));
    }
    if attributes.len() != def.discriminators.len() {
        return Err(ChronicleError::Schema(format!(
            "relationship '{}' takes {} discriminator values, got {}",
            def.name,
            def.discriminators.len(),
            attributes.len()
        )));
    }
    Ok(())
}

/// Resolve participants against their entity stores and append the
/// relationship inside the caller's transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ensure_link(
    conn: &Connection,
    def: &RelationshipDefinition,
    participant_keys: &[FixedHash],
    attributes: &[FieldValue],
    load_time: DateTime<Utc>,
    source_tag: &str,
    policy: OrphanPolicy,
    options: &KeyOptions,
) -> ChronicleResult<LinkOutcome> {
    check_shape(def, participant_keys, attributes)?;
    let load_time = to_stored_precision(load_time);

    let mut resolved = Vec::with_capacity(participant_keys.len());
    let mut substituted_roles = Vec::new();
    for (participant, key) in def.participants.iter().zip(participant_keys) {
        if key.is_sentinel() {
            ensure_sentinels_in(conn, &participant.entity_store)?;
            resolved.push(key.clone());
            continue;
        }
        if entity_exists(conn, &participant.entity_store, key)? {
            resolved.push(key.clone());
            continue;
        }
        match policy {
            OrphanPolicy::Reject => {
                return Err(ChronicleError::OrphanRelationship {
                    store: def.name.clone(),
                    role: participant.role.clone(),
                    key: key.to_string(),
                })
            }
            OrphanPolicy::Substitute => {
                warn!(
                    "Relationship '{}': {} {key} unknown to '{}', substituting error sentinel",
                    def.name, participant.role, participant.entity_store
                );
                ensure_sentinels_in(conn, &participant.entity_store)?;
                substituted_roles.push(participant.role.clone());
                resolved.push(FixedHash::error());
            }
        }
    }

    let relationship_key = derive_relationship_key(&resolved, attributes, options)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO relationship_rows(\
            store, relationship_key, participants_json, attributes_json, load_time, source_tag\
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![
            def.name,
            relationship_key,
            serde_json::to_string(&resolved)?,
            serde_json::to_string(attributes)?,
            format_timestamp(&load_time),
            source_tag,
        ],
    )? > 0;
    if inserted {
        let mut stmt = conn.prepare(
            "INSERT INTO relationship_participants(store, relationship_key, position, role, entity_key) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
        )?;
        for (position, (participant, key)) in def.participants.iter().zip(&resolved).enumerate() {
            stmt.execute(params![def.name, relationship_key, position as i64, participant.role, key])?;
        }
        debug!("New relationship {relationship_key} in '{}'", def.name);
    }

    Ok(LinkOutcome {
        relationship_key,
        participant_keys: resolved,
        inserted,
        substituted_roles,
    })
}
