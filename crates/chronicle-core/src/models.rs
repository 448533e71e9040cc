//! Shared typed models used across hashing, storage, history, and loading.

use std::fmt;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use indexmap::IndexMap;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::errors::{ChronicleError, ChronicleResult};

// ---------------------------------------------------------------------------
// Contract constants
// ---------------------------------------------------------------------------

/// Width of every surrogate key and diff hash, in lowercase hex characters.
pub const HASH_HEX_LEN: usize = 64;

/// Source tag written on records the engine creates on its own behalf.
pub const SYSTEM_SOURCE_TAG: &str = "SYSTEM";

/// Business-key marker stored on the "unknown" sentinel entity.
pub const UNKNOWN_BUSINESS_KEY: &str = "-1";

/// Business-key marker stored on the "error" sentinel entity.
pub const ERROR_BUSINESS_KEY: &str = "-2";

/// Seconds since the epoch of 0001-01-01T00:00:00Z.
const BEGINNING_OF_TIME_SECS: i64 = -62_135_596_800;

/// Seconds since the epoch of 8888-12-31T23:59:59Z.
const END_OF_TIME_SECS: i64 = 218_342_649_599;

/// Timestamp format persisted in every time column. Fixed width with a
/// four-digit year, so lexicographic order equals chronological order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Load time assigned to the "unknown" ghost version.
pub fn beginning_of_time() -> DateTime<Utc> {
    DateTime::from_timestamp(BEGINNING_OF_TIME_SECS, 0).unwrap_or_default()
}

/// Load time assigned to the "error" ghost version.
pub fn end_of_time() -> DateTime<Utc> {
    DateTime::from_timestamp(END_OF_TIME_SECS, 0).unwrap_or_default()
}

/// Truncate `ts` to the microsecond precision of [`TIMESTAMP_FORMAT`].
/// Every instant is passed through this before it is compared or stored.
pub fn to_stored_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> ChronicleResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ChronicleError::Database(format!("invalid timestamp '{raw}': {e}")))
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> ChronicleResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| ChronicleError::Database(format!("invalid date '{raw}': {e}")))
}

// ---------------------------------------------------------------------------
// FixedHash
// ---------------------------------------------------------------------------

/// A 256-bit digest in lowercase hex. Used for surrogate keys, relationship
/// keys, and diff hashes alike.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FixedHash(String);

impl FixedHash {
    /// Parse an already-encoded digest, rejecting anything that is not
    /// exactly 64 lowercase hex characters.
    pub fn parse(raw: &str) -> ChronicleResult<Self> {
        let well_formed = raw.len() == HASH_HEX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(ChronicleError::KeyDerivation(format!(
                "'{raw}' is not a {HASH_HEX_LEN}-character lowercase hex digest"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Wrap a digest produced by this crate's own hasher.
    pub(crate) fn from_digest_hex(hex: String) -> Self {
        debug_assert_eq!(hex.len(), HASH_HEX_LEN);
        Self(hex)
    }

    /// The reserved "unknown / not yet resolved" key (all zeros).
    pub fn unknown() -> Self {
        Self("0".repeat(HASH_HEX_LEN))
    }

    /// The reserved "invalid / error" key (all ones).
    pub fn error() -> Self {
        Self("f".repeat(HASH_HEX_LEN))
    }

    pub fn is_unknown(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    pub fn is_error(&self) -> bool {
        self.0.bytes().all(|b| b == b'f')
    }

    pub fn is_sentinel(&self) -> bool {
        self.is_unknown() || self.is_error()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FixedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FixedHash {
    type Error = ChronicleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FixedHash::parse(&value)
    }
}

impl From<FixedHash> for String {
    fn from(value: FixedHash) -> Self {
        value.0
    }
}

impl ToSql for FixedHash {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for FixedHash {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        FixedHash::parse(raw).map_err(|e| FromSqlError::Other(e.to_string().into()))
    }
}

// ---------------------------------------------------------------------------
// Field values and tuples
// ---------------------------------------------------------------------------

/// A single typed business-key or attribute value as delivered by the
/// extraction layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Ordered attribute payload. Order of insertion is preserved so a payload
/// round-trips through JSON unchanged.
pub type AttributeTuple = IndexMap<String, FieldValue>;

/// A business key: an ordered tuple of typed fields plus an optional
/// discriminator naming the source table when one physical key space is
/// shared by several logical feeds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessKey {
    pub fields: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
}

impl BusinessKey {
    pub fn new(fields: Vec<FieldValue>) -> Self {
        Self {
            fields,
            discriminator: None,
        }
    }

    pub fn single(value: impl Into<FieldValue>) -> Self {
        Self::new(vec![value.into()])
    }

    pub fn with_discriminator(mut self, source_table: impl Into<String>) -> Self {
        self.discriminator = Some(source_table.into());
        self
    }

    /// True when there is at least one field and every field is null. Such
    /// keys collapse onto a single surrogate and are normally routed to the
    /// unknown sentinel instead.
    pub fn is_all_null(&self) -> bool {
        !self.fields.is_empty() && self.fields.iter().all(FieldValue::is_null)
    }
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

/// One row of an entity store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub surrogate_key: FixedHash,
    pub business_key: BusinessKey,
    pub first_seen: DateTime<Utc>,
    pub source_tag: String,
    pub source_table: Option<String>,
    pub is_sentinel: bool,
}

/// One version row of an attribute history store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeVersion {
    /// Insertion sequence; only meaningful as a tie-breaker.
    pub seq: i64,
    pub entity_key: FixedHash,
    pub diff_hash: FixedHash,
    pub load_time: DateTime<Utc>,
    pub source_tag: String,
    pub is_current: bool,
    pub end_time: Option<DateTime<Utc>>,
    pub payload: AttributeTuple,
    pub schema_version: u32,
}

/// One row of a relationship store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub relationship_key: FixedHash,
    pub participant_keys: Vec<FixedHash>,
    pub attributes: Vec<FieldValue>,
    pub load_time: DateTime<Utc>,
    pub source_tag: String,
}

/// One validity interval of a relationship seen from its driving key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityInterval {
    pub seq: i64,
    pub relationship_key: FixedHash,
    pub driving_key: FixedHash,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// One point-in-time row: the version of `attribute_store` applicable to
/// `entity_key` on `snapshot_date`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PitRow {
    pub entity_key: FixedHash,
    pub snapshot_date: NaiveDate,
    pub attribute_store: String,
    pub applicable_version_key: Option<FixedHash>,
    pub applicable_load_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_hash_rejects_uppercase_and_short_values() {
        assert!(FixedHash::parse(&"A".repeat(64)).is_err());
        assert!(FixedHash::parse("abc").is_err());
        assert!(FixedHash::parse(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn sentinel_keys_are_recognised() {
        assert!(FixedHash::unknown().is_unknown());
        assert!(FixedHash::error().is_error());
        assert!(!FixedHash::unknown().is_error());
        assert!(!FixedHash::parse(&"a".repeat(64)).unwrap().is_sentinel());
    }

    #[test]
    fn boundary_timestamps_round_trip_through_text() {
        let bot = beginning_of_time();
        let eot = end_of_time();
        assert_eq!(format_timestamp(&bot), "0001-01-01T00:00:00.000000Z");
        assert_eq!(format_timestamp(&eot), "8888-12-31T23:59:59.000000Z");
        assert_eq!(parse_timestamp(&format_timestamp(&bot)).unwrap(), bot);
        assert!(format_timestamp(&bot) < format_timestamp(&eot));
    }

    #[test]
    fn stored_precision_drops_sub_microsecond_digits() {
        let ts = DateTime::from_timestamp(1_704_412_800, 123_456_789).unwrap();
        let stored = to_stored_precision(ts);
        assert_eq!(stored, DateTime::from_timestamp(1_704_412_800, 123_456_000).unwrap());
        assert_eq!(parse_timestamp(&format_timestamp(&ts)).unwrap(), stored);
        assert_eq!(to_stored_precision(stored), stored);
    }

    #[test]
    fn field_value_json_shape_is_tagged() {
        let json = serde_json::to_string(&FieldValue::Int(7)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":7}"#);
        let null = serde_json::to_string(&FieldValue::Null).unwrap();
        assert_eq!(null, r#"{"type":"null"}"#);
    }

    #[test]
    fn all_null_business_key_detection() {
        assert!(BusinessKey::new(vec![FieldValue::Null, FieldValue::Null]).is_all_null());
        assert!(!BusinessKey::new(vec![FieldValue::Null, "x".into()]).is_all_null());
        assert!(!BusinessKey::new(vec![]).is_all_null());
    }
}
