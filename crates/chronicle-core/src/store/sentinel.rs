//! Ghost records for the reserved "unknown" and "error" keys.
//!
//! Every entity store carries two sentinel rows, and every attribute store
//! hanging off it one ghost version per sentinel, so joins from facts with
//! unresolved or invalid references still land on a row.

use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::errors::ChronicleResult;
use crate::models::{
    beginning_of_time, end_of_time, BusinessKey, EntityRecord, FixedHash, ERROR_BUSINESS_KEY,
    SYSTEM_SOURCE_TAG, UNKNOWN_BUSINESS_KEY,
};
use crate::store::attributes::insert_ghost;
use crate::store::entity::insert_entity;
use crate::store::registry::{attribute_stores_of, AttributeStoreDef};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SentinelSummary {
    pub entity_rows_inserted: usize,
    pub attribute_rows_inserted: usize,
}

impl SentinelSummary {
    pub fn is_noop(&self) -> bool {
        self.entity_rows_inserted == 0 && self.attribute_rows_inserted == 0
    }
}

fn sentinel_record(key: FixedHash, marker: &str) -> EntityRecord {
    EntityRecord {
        surrogate_key: key,
        business_key: BusinessKey::single(marker),
        first_seen: beginning_of_time(),
        source_tag: SYSTEM_SOURCE_TAG.to_string(),
        source_table: None,
        is_sentinel: true,
    }
}

/// Insert whatever sentinel rows are missing for `entity_store` and its
/// attribute stores. Running it again writes nothing.
pub(crate) fn ensure_sentinels_in(conn: &Connection, entity_store: &str) -> ChronicleResult<SentinelSummary> {
    let mut summary = SentinelSummary::default();
    for (key, marker) in [
        (FixedHash::unknown(), UNKNOWN_BUSINESS_KEY),
        (FixedHash::error(), ERROR_BUSINESS_KEY),
    ] {
        if insert_entity(conn, entity_store, &sentinel_record(key, marker))? {
            summary.entity_rows_inserted += 1;
        }
    }
    for def in attribute_stores_of(conn, entity_store)? {
        summary.attribute_rows_inserted += ensure_ghost_versions(conn, &def)?;
    }
    if !summary.is_noop() {
        info!(
            "Sentinels for '{entity_store}': {} entity rows, {} ghost versions inserted",
            summary.entity_rows_inserted, summary.attribute_rows_inserted
        );
    }
    Ok(summary)
}

/// Ghost versions for one attribute store: the unknown ghost opens at the
/// beginning of time, the error ghost at the end of time.
pub(crate) fn ensure_ghost_versions(conn: &Connection, def: &AttributeStoreDef) -> ChronicleResult<usize> {
    let mut inserted = 0;
    if insert_ghost(conn, def, &FixedHash::unknown(), beginning_of_time(), SYSTEM_SOURCE_TAG)? {
        inserted += 1;
    }
    if insert_ghost(conn, def, &FixedHash::error(), end_of_time(), SYSTEM_SOURCE_TAG)? {
        inserted += 1;
    }
    Ok(inserted)
}
