//! Point-in-time projection.
//!
//! For every (entity, snapshot date) the applicable version is the one with
//! the latest load time whose UTC calendar date is on or before the snapshot
//! date. Output is fully sorted, so the same history always projects to the
//! same bytes.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};

use crate::config::PitMissingPolicy;
use crate::hashing::canonical::sha256_hex;
use crate::models::{beginning_of_time, format_date, format_timestamp, FixedHash, PitRow};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPoint {
    pub seq: i64,
    pub diff_hash: FixedHash,
    pub load_time: DateTime<Utc>,
}

/// Project one attribute store onto the snapshot grid.
///
/// A snapshot date stands for the end of that UTC day: a version loaded at
/// any instant on `date` already applies to it, and one loaded at midnight
/// of the next day does not.
pub fn project(
    attribute_store: &str,
    entity_keys: &[FixedHash],
    versions: &HashMap<FixedHash, Vec<VersionPoint>>,
    dates: &[NaiveDate],
    missing: PitMissingPolicy,
) -> Vec<PitRow> {
    let keys: BTreeSet<&FixedHash> = entity_keys.iter().collect();
    let dates: BTreeSet<NaiveDate> = dates.iter().copied().collect();
    let mut rows = Vec::with_capacity(keys.len() * dates.len());

    for key in keys {
        let mut timeline: Vec<&VersionPoint> = versions
            .get(key)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        timeline.sort_by_key(|v| (v.load_time, v.seq));

        for date in &dates {
            let applicable = timeline.partition_point(|v| v.load_time.date_naive() <= *date);
            let (version_key, load_time) = match applicable.checked_sub(1).map(|i| timeline[i]) {
                Some(v) => (Some(v.diff_hash.clone()), Some(v.load_time)),
                None => match missing {
                    PitMissingPolicy::Null => (None, None),
                    PitMissingPolicy::Sentinel => {
                        (Some(FixedHash::unknown()), Some(beginning_of_time()))
                    }
                },
            };
            rows.push(PitRow {
                entity_key: key.clone(),
                snapshot_date: *date,
                attribute_store: attribute_store.to_string(),
                applicable_version_key: version_key,
                applicable_load_time: load_time,
            });
        }
    }
    rows
}

/// SHA-256 over the canonical text rendering of `rows` in their sorted
/// order. Equal digests mean byte-identical projections.
pub fn pit_digest(rows: &[PitRow]) -> String {
    let mut sorted: Vec<&PitRow> = rows.iter().collect();
    sorted.sort();
    let mut text = String::new();
    for row in sorted {
        text.push_str(row.entity_key.as_str());
        text.push('|');
        text.push_str(&format_date(&row.snapshot_date));
        text.push('|');
        text.push_str(&row.attribute_store);
        text.push('|');
        if let Some(k) = &row.applicable_version_key {
            text.push_str(k.as_str());
        }
        text.push('|');
        if let Some(ts) = &row.applicable_load_time {
            text.push_str(&format_timestamp(ts));
        }
        text.push('\n');
    }
    sha256_hex(&text)
}
