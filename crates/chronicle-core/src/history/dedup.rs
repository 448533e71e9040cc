//! Change detection for a single candidate version.

use chrono::{DateTime, Utc};

use crate::config::TieBreakPolicy;
use crate::errors::{ChronicleError, ChronicleResult};
use crate::models::FixedHash;

/// A version already recorded for the entity, whatever its current flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownVersion {
    pub seq: i64,
    pub diff_hash: FixedHash,
    pub load_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendDecision {
    Insert,
    /// The exact (hash, load time) pair is already stored: a replayed load.
    Replay,
    /// A chronologically adjacent version already carries this hash.
    Unchanged,
}

/// Decide whether `diff_hash` at `load_time` is a new version.
///
/// All known versions are consulted, not only the one flagged current,
/// because the flags may be stale until the maintenance pass runs. The
/// candidate is compared with its chronological neighbours: a value that
/// reverts to an earlier state is a new version, but a payload equal to the
/// version before it or the version right after it (a late, out-of-order
/// load) is unchanged. Stored rows are never moved, so the later copy keeps
/// its load time.
///
/// `load_time` must already be at stored precision.
pub fn decide_append(
    store: &str,
    entity_key: &FixedHash,
    known: &[KnownVersion],
    diff_hash: &FixedHash,
    load_time: DateTime<Utc>,
    policy: TieBreakPolicy,
) -> ChronicleResult<AppendDecision> {
    if known
        .iter()
        .any(|v| v.load_time == load_time && &v.diff_hash == diff_hash)
    {
        return Ok(AppendDecision::Replay);
    }
    if policy == TieBreakPolicy::Reject && known.iter().any(|v| v.load_time == load_time) {
        return Err(ChronicleError::SimultaneousLoadTime {
            store: store.to_string(),
            entity_key: entity_key.to_string(),
            load_time,
        });
    }
    let predecessor = known
        .iter()
        .filter(|v| v.load_time <= load_time)
        .max_by_key(|v| (v.load_time, v.seq));
    let successor = known
        .iter()
        .filter(|v| v.load_time > load_time)
        .min_by_key(|v| (v.load_time, v.seq));
    let same = |v: Option<&KnownVersion>| v.is_some_and(|v| &v.diff_hash == diff_hash);
    if same(predecessor) || same(successor) {
        Ok(AppendDecision::Unchanged)
    } else {
        Ok(AppendDecision::Insert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn h(c: char) -> FixedHash {
        FixedHash::parse(&c.to_string().repeat(64)).unwrap()
    }

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn known(rows: &[(i64, char, u32)]) -> Vec<KnownVersion> {
        rows.iter()
            .map(|(seq, c, day)| KnownVersion {
                seq: *seq,
                diff_hash: h(*c),
                load_time: t(*day),
            })
            .collect()
    }

    fn decide(known: &[KnownVersion], c: char, day: u32, policy: TieBreakPolicy) -> ChronicleResult<AppendDecision> {
        decide_append("sat", &h('1'), known, &h(c), t(day), policy)
    }

    #[test]
    fn first_version_is_inserted() {
        assert_eq!(decide(&[], 'a', 1, TieBreakPolicy::Reject).unwrap(), AppendDecision::Insert);
    }

    #[test]
    fn unchanged_payload_is_skipped() {
        let k = known(&[(1, 'a', 1)]);
        assert_eq!(decide(&k, 'a', 2, TieBreakPolicy::Reject).unwrap(), AppendDecision::Unchanged);
        assert_eq!(decide(&k, 'a', 1, TieBreakPolicy::Reject).unwrap(), AppendDecision::Replay);
    }

    #[test]
    fn reverting_value_is_a_new_version() {
        let k = known(&[(1, 'a', 1), (2, 'b', 2)]);
        assert_eq!(decide(&k, 'a', 3, TieBreakPolicy::Reject).unwrap(), AppendDecision::Insert);
    }

    #[test]
    fn stale_current_flags_do_not_matter() {
        // Inserted out of order: predecessor by time is 'b', not the last row.
        let k = known(&[(1, 'b', 5), (2, 'a', 1)]);
        assert_eq!(decide(&k, 'b', 6, TieBreakPolicy::Reject).unwrap(), AppendDecision::Unchanged);
        assert_eq!(decide(&k, 'a', 3, TieBreakPolicy::Reject).unwrap(), AppendDecision::Unchanged);
    }

    #[test]
    fn late_copy_of_the_next_version_is_unchanged() {
        let k = known(&[(1, 'a', 5)]);
        assert_eq!(decide(&k, 'a', 3, TieBreakPolicy::Reject).unwrap(), AppendDecision::Unchanged);

        // b@3 between a@1 and b@5 would leave two consecutive b versions.
        let k = known(&[(1, 'a', 1), (2, 'b', 5)]);
        assert_eq!(decide(&k, 'b', 3, TieBreakPolicy::Reject).unwrap(), AppendDecision::Unchanged);
        assert_eq!(decide(&k, 'c', 3, TieBreakPolicy::Reject).unwrap(), AppendDecision::Insert);
        // Only the immediate successor counts.
        let k = known(&[(1, 'a', 5), (2, 'b', 7)]);
        assert_eq!(decide(&k, 'b', 3, TieBreakPolicy::Reject).unwrap(), AppendDecision::Insert);
    }

    #[test]
    fn same_instant_conflicts_follow_policy() {
        let k = known(&[(1, 'a', 1)]);
        let err = decide(&k, 'b', 1, TieBreakPolicy::Reject).unwrap_err();
        assert!(matches!(err, ChronicleError::SimultaneousLoadTime { .. }));
        assert_eq!(
            decide(&k, 'b', 1, TieBreakPolicy::InsertionOrder).unwrap(),
            AppendDecision::Insert
        );
    }
}
