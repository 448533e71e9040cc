//! Error types for the chronicle core library.

use chrono::{DateTime, Utc};

/// Top-level error enum for the chronicle core library.
#[derive(Debug, thiserror::Error)]
pub enum ChronicleError {
    #[error("Database error: {0}")]
    Database(String),

    /// Business key fields could not be canonicalised. Fatal for the row only.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Two versions of one entity share a load time and the active
    /// tie-break policy refuses to order them.
    #[error("Simultaneous load time in '{store}' for {entity_key} at {load_time}")]
    SimultaneousLoadTime {
        store: String,
        entity_key: String,
        load_time: DateTime<Utc>,
    },

    #[error("Orphan relationship in '{store}': participant '{role}' key {key} is not a known entity")]
    OrphanRelationship {
        store: String,
        role: String,
        key: String,
    },

    #[error("Stale observation in '{store}' for driving key {driving_key}: {observed_at} precedes active interval start {active_since}")]
    StaleObservation {
        store: String,
        driving_key: String,
        observed_at: DateTime<Utc>,
        active_since: DateTime<Utc>,
    },

    #[error("Key {0} is reserved for sentinel records")]
    ReservedKey(String),

    #[error("Unknown store '{0}'")]
    UnknownStore(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChronicleError {
    /// Stable short label used when persisting rejections.
    pub fn category(&self) -> &'static str {
        match self {
            ChronicleError::Database(_) => "database",
            ChronicleError::KeyDerivation(_) => "key_derivation",
            ChronicleError::SimultaneousLoadTime { .. } => "simultaneous_load_time",
            ChronicleError::OrphanRelationship { .. } => "orphan_relationship",
            ChronicleError::StaleObservation { .. } => "stale_observation",
            ChronicleError::ReservedKey(_) => "reserved_key",
            ChronicleError::UnknownStore(_) => "unknown_store",
            ChronicleError::Schema(_) => "schema",
            ChronicleError::Config(_) => "config",
            ChronicleError::Io(_) => "io",
            ChronicleError::Sqlite(_) => "sqlite",
            ChronicleError::Json(_) => "json",
        }
    }

    /// Whether the error only condemns the row being processed, leaving the
    /// rest of the cycle intact.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            ChronicleError::KeyDerivation(_)
                | ChronicleError::SimultaneousLoadTime { .. }
                | ChronicleError::OrphanRelationship { .. }
                | ChronicleError::StaleObservation { .. }
                | ChronicleError::ReservedKey(_)
                | ChronicleError::Schema(_)
        )
    }
}

pub type ChronicleResult<T> = Result<T, ChronicleError>;
