//! Driving-key interval state machine for relationship validity.
//!
//! States are "no active interval" and "active on relationship R". Only a
//! change of relationship between observations moves the machine; a missing
//! observation never closes an interval.

use chrono::{DateTime, Utc};

use crate::errors::{ChronicleError, ChronicleResult};
use crate::models::FixedHash;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveInterval {
    pub seq: i64,
    pub relationship_key: FixedHash,
    pub start_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The active interval already points at the observed relationship.
    Unchanged,
    Open {
        relationship_key: FixedHash,
        start_time: DateTime<Utc>,
    },
    /// Close the active interval at `start_time` and open the new one.
    Supersede {
        closed_seq: i64,
        closed_relationship_key: FixedHash,
        relationship_key: FixedHash,
        start_time: DateTime<Utc>,
    },
}

pub fn next_transition(
    store: &str,
    driving_key: &FixedHash,
    active: Option<&ActiveInterval>,
    relationship_key: &FixedHash,
    observed_at: DateTime<Utc>,
) -> ChronicleResult<Transition> {
    let Some(active) = active else {
        return Ok(Transition::Open {
            relationship_key: relationship_key.clone(),
            start_time: observed_at,
        });
    };
    if &active.relationship_key == relationship_key {
        return Ok(Transition::Unchanged);
    }
    if observed_at < active.start_time {
        return Err(ChronicleError::StaleObservation {
            store: store.to_string(),
            driving_key: driving_key.to_string(),
            observed_at,
            active_since: active.start_time,
        });
    }
    if observed_at == active.start_time {
        return Err(ChronicleError::SimultaneousLoadTime {
            store: store.to_string(),
            entity_key: driving_key.to_string(),
            load_time: observed_at,
        });
    }
    Ok(Transition::Supersede {
        closed_seq: active.seq,
        closed_relationship_key: active.relationship_key.clone(),
        relationship_key: relationship_key.clone(),
        start_time: observed_at,
    })
}
