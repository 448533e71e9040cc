//! Engine configuration: policies, hashing options, and parallelism.
//!
//! Defaults are safe for production. Values can be loaded from JSON and
//! overridden through `CHRONICLE_*` environment variables.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ChronicleError, ChronicleResult};
use crate::hashing::KeyOptions;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 64;

/// What to do when two versions of one entity share a load time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    /// Surface `SimultaneousLoadTime` to the caller.
    #[default]
    Reject,
    /// Order same-instant versions by insertion sequence.
    InsertionOrder,
}

/// What to do when a relationship names a participant its entity store has
/// never seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    #[default]
    Reject,
    /// Point the participant at the error sentinel instead.
    Substitute,
}

/// How point-in-time rows express "no version applies yet".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitMissingPolicy {
    /// Leave version key and load time null.
    #[default]
    Null,
    /// Use the unknown sentinel key and the beginning of time, so marts can
    /// equi-join without outer joins.
    Sentinel,
}

fn parse_enum<T: for<'de> Deserialize<'de>>(raw: &str, what: &str) -> ChronicleResult<T> {
    let normalised = raw.trim().to_lowercase().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(normalised))
        .map_err(|_| ChronicleError::Config(format!("invalid {what} '{raw}'")))
}

impl FromStr for TieBreakPolicy {
    type Err = ChronicleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_enum(s, "tie-break policy")
    }
}

impl FromStr for OrphanPolicy {
    type Err = ChronicleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_enum(s, "orphan policy")
    }
}

impl FromStr for PitMissingPolicy {
    type Err = ChronicleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_enum(s, "PIT missing policy")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChronicleConfig {
    pub tie_break: TieBreakPolicy,
    pub orphan_policy: OrphanPolicy,
    pub pit_missing: PitMissingPolicy,
    /// Send rows whose business key is entirely null to the unknown
    /// sentinel instead of minting a collapsed entity for them.
    pub route_null_keys_to_unknown: bool,
    pub business_key: KeyOptions,
    pub fingerprint: KeyOptions,
    /// Rayon threads used to hash a batch.
    pub workers: usize,
}

impl Default for ChronicleConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreakPolicy::default(),
            orphan_policy: OrphanPolicy::default(),
            pit_missing: PitMissingPolicy::default(),
            route_null_keys_to_unknown: true,
            business_key: KeyOptions::business_key(),
            fingerprint: KeyOptions::fingerprint(),
            workers: 4,
        }
    }
}

fn parse_flag(raw: &str, name: &str) -> ChronicleResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ChronicleError::Config(format!("{name}: expected a boolean, got '{raw}'"))),
    }
}

impl ChronicleConfig {
    pub fn from_json_str(raw: &str) -> ChronicleResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validated()
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> ChronicleResult<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `CHRONICLE_*` overrides fetched through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> ChronicleResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CHRONICLE_TIE_BREAK") {
            self.tie_break = v.parse()?;
        }
        if let Some(v) = lookup("CHRONICLE_ORPHAN_POLICY") {
            self.orphan_policy = v.parse()?;
        }
        if let Some(v) = lookup("CHRONICLE_PIT_MISSING") {
            self.pit_missing = v.parse()?;
        }
        if let Some(v) = lookup("CHRONICLE_ROUTE_NULL_KEYS") {
            self.route_null_keys_to_unknown = parse_flag(&v, "CHRONICLE_ROUTE_NULL_KEYS")?;
        }
        if let Some(v) = lookup("CHRONICLE_KEY_CASE_SENSITIVE") {
            self.business_key.case_sensitive = parse_flag(&v, "CHRONICLE_KEY_CASE_SENSITIVE")?;
        }
        if let Some(v) = lookup("CHRONICLE_KEY_TRIM") {
            self.business_key.trim = parse_flag(&v, "CHRONICLE_KEY_TRIM")?;
        }
        if let Some(v) = lookup("CHRONICLE_WORKERS") {
            self.workers = v.trim().parse().map_err(|_| {
                ChronicleError::Config(format!("CHRONICLE_WORKERS: expected an integer, got '{v}'"))
            })?;
        }
        self.validated()
    }

    /// Clamp worker count into its supported range.
    pub fn validated(mut self) -> ChronicleResult<Self> {
        self.workers = self.workers.clamp(MIN_WORKERS, MAX_WORKERS);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_conservative() {
        let config = ChronicleConfig::default();
        assert_eq!(config.tie_break, TieBreakPolicy::Reject);
        assert_eq!(config.orphan_policy, OrphanPolicy::Reject);
        assert_eq!(config.pit_missing, PitMissingPolicy::Null);
        assert!(config.route_null_keys_to_unknown);
        assert!(!config.business_key.case_sensitive);
        assert!(config.fingerprint.case_sensitive);
    }

    #[test]
    fn env_overrides_apply() {
        let config = ChronicleConfig::default()
            .with_overrides(lookup(&[
                ("CHRONICLE_TIE_BREAK", "insertion-order"),
                ("CHRONICLE_ORPHAN_POLICY", "SUBSTITUTE"),
                ("CHRONICLE_ROUTE_NULL_KEYS", "off"),
                ("CHRONICLE_WORKERS", "500"),
            ]))
            .unwrap();
        assert_eq!(config.tie_break, TieBreakPolicy::InsertionOrder);
        assert_eq!(config.orphan_policy, OrphanPolicy::Substitute);
        assert!(!config.route_null_keys_to_unknown);
        assert_eq!(config.workers, MAX_WORKERS);
    }

    #[test]
    fn bad_env_values_are_config_errors() {
        let err = ChronicleConfig::default()
            .with_overrides(lookup(&[("CHRONICLE_TIE_BREAK", "coin-flip")]))
            .unwrap_err();
        assert!(matches!(err, ChronicleError::Config(_)));
        assert!(ChronicleConfig::default()
            .with_overrides(lookup(&[("CHRONICLE_KEY_TRIM", "maybe")]))
            .is_err());
    }

    #[test]
    fn json_loading_fills_defaults() {
        let config =
            ChronicleConfig::from_json_str(r#"{"tie_break":"insertion_order","workers":0}"#).unwrap();
        assert_eq!(config.tie_break, TieBreakPolicy::InsertionOrder);
        assert_eq!(config.workers, MIN_WORKERS);
        assert_eq!(config.orphan_policy, OrphanPolicy::Reject);
    }
}
