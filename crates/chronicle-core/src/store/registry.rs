//! Persistent registry of named stores and their definitions.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{ChronicleError, ChronicleResult};
use crate::hashing::SchemaDescriptor;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Entity,
    Attribute,
    Relationship,
    Validity,
    Pit,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Entity => "entity",
            StoreKind::Attribute => "attribute",
            StoreKind::Relationship => "relationship",
            StoreKind::Validity => "validity",
            StoreKind::Pit => "pit",
        }
    }

    fn parse(raw: &str) -> ChronicleResult<Self> {
        match raw {
            "entity" => Ok(StoreKind::Entity),
            "attribute" => Ok(StoreKind::Attribute),
            "relationship" => Ok(StoreKind::Relationship),
            "validity" => Ok(StoreKind::Validity),
            "pit" => Ok(StoreKind::Pit),
            other => Err(ChronicleError::Database(format!("unknown store kind '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStoreDef {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeStoreDef {
    pub name: String,
    pub entity_store: String,
    pub descriptor: SchemaDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantDef {
    pub role: String,
    pub entity_store: String,
}

impl ParticipantDef {
    pub fn new(role: impl Into<String>, entity_store: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            entity_store: entity_store.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    pub name: String,
    /// Participants in key order; the order is part of the relationship key.
    pub participants: Vec<ParticipantDef>,
    /// Names of attributes that distinguish otherwise identical
    /// associations (e.g. a role). Their values are hashed into the key.
    #[serde(default)]
    pub discriminators: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityDef {
    pub name: String,
    pub relationship_store: String,
    pub driving_role: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitDef {
    pub name: String,
    pub entity_store: String,
    pub attribute_stores: Vec<String>,
}

/// Reject names that are not lowercase identifiers.
pub fn validate_name(what: &str, name: &str) -> ChronicleResult<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(ChronicleError::Schema(format!(
            "{what} name '{name}' must match {}",
            NAME_RE.as_str()
        )))
    }
}

/// A registry row as stored.
#[derive(Clone, Debug)]
pub(crate) struct RegistryEntry {
    pub kind: StoreKind,
    pub definition_json: String,
    pub schema_version: u32,
}

pub(crate) fn lookup(conn: &Connection, name: &str) -> ChronicleResult<Option<RegistryEntry>> {
    let row = conn
        .query_row(
            "SELECT kind, definition_json, schema_version FROM store_registry WHERE name = ?1;",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                ))
            },
        )
        .optional()?;
    row.map(|(kind, definition_json, schema_version)| {
        Ok(RegistryEntry {
            kind: StoreKind::parse(&kind)?,
            definition_json,
            schema_version,
        })
    })
    .transpose()
}

pub(crate) fn insert(
    conn: &Connection,
    name: &str,
    kind: StoreKind,
    parent: Option<&str>,
    definition_json: &str,
    schema_version: u32,
) -> ChronicleResult<()> {
    conn.execute(
        "INSERT INTO store_registry(name, kind, parent, definition_json, schema_version) \
         VALUES (?1, ?2, ?3, ?4, ?5);",
        params![name, kind.as_str(), parent, definition_json, schema_version],
    )?;
    Ok(())
}

pub(crate) fn update_definition(
    conn: &Connection,
    name: &str,
    definition_json: &str,
    schema_version: u32,
) -> ChronicleResult<()> {
    conn.execute(
        "UPDATE store_registry \
         SET definition_json = ?1, schema_version = ?2, updated_at = CURRENT_TIMESTAMP \
         WHERE name = ?3;",
        params![definition_json, schema_version, name],
    )?;
    Ok(())
}

/// Load a definition, checking that `name` is registered with `kind`.
pub(crate) fn load<T: DeserializeOwned>(
    conn: &Connection,
    name: &str,
    kind: StoreKind,
) -> ChronicleResult<T> {
    let entry = lookup(conn, name)?.ok_or_else(|| ChronicleError::UnknownStore(name.to_string()))?;
    if entry.kind != kind {
        return Err(ChronicleError::Schema(format!(
            "store '{name}' is a {} store, not a {} store",
            entry.kind.as_str(),
            kind.as_str()
        )));
    }
    Ok(serde_json::from_str(&entry.definition_json)?)
}

/// Every attribute store hanging off `entity_store`, ordered by name.
pub(crate) fn attribute_stores_of(
    conn: &Connection,
    entity_store: &str,
) -> ChronicleResult<Vec<AttributeStoreDef>> {
    let mut stmt = conn.prepare(
        "SELECT definition_json FROM store_registry \
         WHERE kind = 'attribute' AND parent = ?1 ORDER BY name;",
    )?;
    let raw: Vec<String> = stmt
        .query_map(params![entity_store], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    raw.iter()
        .map(|json| serde_json::from_str(json).map_err(ChronicleError::from))
        .collect()
}

/// Structural checks for a relationship definition.
pub(crate) fn validate_relationship(def: &RelationshipDefinition) -> ChronicleResult<()> {
    validate_name("relationship store", &def.name)?;
    if def.participants.len() < 2 {
        return Err(ChronicleError::Schema(format!(
            "relationship '{}' needs at least two participants",
            def.name
        )));
    }
    let mut roles = HashSet::new();
    for p in &def.participants {
        validate_name("participant role", &p.role)?;
        if !roles.insert(p.role.as_str()) {
            return Err(ChronicleError::Schema(format!(
                "relationship '{}': role '{}' listed twice",
                def.name, p.role
            )));
        }
    }
    for d in &def.discriminators {
        validate_name("discriminator", d)?;
    }
    Ok(())
}
