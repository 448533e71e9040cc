//! SQLite persistence for the history stores.

pub mod attributes;
pub mod database;
pub mod entity;
pub mod pit;
pub mod registry;
pub mod relationship;
pub mod schema;
pub mod sentinel;
pub mod validity;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;

use crate::models::{parse_date, parse_timestamp};

fn conversion_failure(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Read a persisted timestamp column.
pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| conversion_failure(idx, e.to_string()))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_timestamp(&r).map_err(|e| conversion_failure(idx, e.to_string())))
        .transpose()
}

pub(crate) fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    parse_date(&raw).map_err(|e| conversion_failure(idx, e.to_string()))
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_failure(idx, e.to_string()))
}
