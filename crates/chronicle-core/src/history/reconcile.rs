//! Current-flag and end-date maintenance as a pure recomputation.
//!
//! The flags of an entity's versions are a function of its
//! `(load_time, seq)` pairs alone: the latest version is current with no end
//! time, and every other version ends where its chronological successor
//! begins. Planning emits only the rows whose stored flags disagree, so the
//! resulting write set is empty on a re-run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::TieBreakPolicy;
use crate::errors::{ChronicleError, ChronicleResult};
use crate::models::FixedHash;

/// The maintenance-relevant columns of one stored version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionSlot {
    pub seq: i64,
    pub entity_key: FixedHash,
    pub load_time: DateTime<Utc>,
    pub is_current: bool,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagUpdate {
    pub seq: i64,
    pub is_current: bool,
    pub end_time: Option<DateTime<Utc>>,
}

/// Plan the flag updates for `slots`, which may cover any number of
/// entities in any physical order. Updates are returned sorted by `seq`.
pub fn plan_current_flags(
    store: &str,
    slots: &[VersionSlot],
    policy: TieBreakPolicy,
) -> ChronicleResult<Vec<FlagUpdate>> {
    let mut by_entity: BTreeMap<&FixedHash, Vec<&VersionSlot>> = BTreeMap::new();
    for slot in slots {
        by_entity.entry(&slot.entity_key).or_default().push(slot);
    }

    let mut updates = Vec::new();
    for (entity_key, mut versions) in by_entity {
        versions.sort_by_key(|v| (v.load_time, v.seq));

        if policy == TieBreakPolicy::Reject {
            if let Some(pair) = versions.windows(2).find(|w| w[0].load_time == w[1].load_time) {
                return Err(ChronicleError::SimultaneousLoadTime {
                    store: store.to_string(),
                    entity_key: entity_key.to_string(),
                    load_time: pair[0].load_time,
                });
            }
        }

        for (position, version) in versions.iter().enumerate() {
            let (is_current, end_time) = match versions.get(position + 1) {
                Some(successor) => (false, Some(successor.load_time)),
                None => (true, None),
            };
            if version.is_current != is_current || version.end_time != end_time {
                updates.push(FlagUpdate {
                    seq: version.seq,
                    is_current,
                    end_time,
                });
            }
        }
    }
    updates.sort_by_key(|u| u.seq);
    Ok(updates)
}
