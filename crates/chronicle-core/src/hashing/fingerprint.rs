//! Change fingerprints ("diff hashes") over versioned attribute layouts.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{ChronicleError, ChronicleResult};
use crate::hashing::canonical::{canonical_join, sha256_hex, KeyOptions};
use crate::models::{AttributeTuple, FieldValue, FixedHash};

static ATTRIBUTE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").unwrap());

/// The ordered set of attributes an attribute store fingerprints.
///
/// Reordering, adding, or removing an attribute changes the hash of every
/// row and is a breaking migration; bump `version` when doing so.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub version: u32,
    pub attributes: Vec<String>,
}

impl SchemaDescriptor {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        version: u32,
        attributes: impl IntoIterator<Item = S>,
    ) -> ChronicleResult<Self> {
        let descriptor = Self {
            name: name.into(),
            version,
            attributes: attributes.into_iter().map(Into::into).collect(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> ChronicleResult<()> {
        if self.attributes.is_empty() {
            return Err(ChronicleError::Schema(format!(
                "descriptor '{}' lists no attributes",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for attr in &self.attributes {
            if !ATTRIBUTE_NAME_RE.is_match(attr) {
                return Err(ChronicleError::Schema(format!(
                    "descriptor '{}': invalid attribute name '{attr}'",
                    self.name
                )));
            }
            if !seen.insert(attr.as_str()) {
                return Err(ChronicleError::Schema(format!(
                    "descriptor '{}': attribute '{attr}' listed twice",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Digest of the attribute layout alone. Two descriptors with the same
    /// layout hash produce identical fingerprints for identical payloads.
    pub fn layout_hash(&self) -> String {
        sha256_hex(&self.attributes.join("\n"))
    }

    /// Extract the payload's values in descriptor order. Missing attributes
    /// are null; attributes the descriptor does not know are an error so
    /// nothing is dropped silently.
    pub fn project(&self, payload: &AttributeTuple) -> ChronicleResult<Vec<FieldValue>> {
        if let Some(extra) = payload
            .keys()
            .find(|k| !self.attributes.iter().any(|a| a == *k))
        {
            return Err(ChronicleError::Schema(format!(
                "attribute '{extra}' is not part of descriptor '{}' v{}",
                self.name, self.version
            )));
        }
        Ok(self
            .attributes
            .iter()
            .map(|a| payload.get(a).cloned().unwrap_or(FieldValue::Null))
            .collect())
    }

    /// Rebuild a payload in descriptor order from projected values.
    pub fn to_payload(&self, values: Vec<FieldValue>) -> AttributeTuple {
        self.attributes.iter().cloned().zip(values).collect()
    }

    /// An all-null payload, used for ghost versions.
    pub fn null_payload(&self) -> AttributeTuple {
        self.attributes
            .iter()
            .map(|a| (a.clone(), FieldValue::Null))
            .collect()
    }
}

/// Fingerprint a payload under `descriptor`.
pub fn fingerprint(
    descriptor: &SchemaDescriptor,
    payload: &AttributeTuple,
    options: &KeyOptions,
) -> ChronicleResult<FixedHash> {
    let values = descriptor.project(payload)?;
    fingerprint_values(&values, options)
}

/// Fingerprint values already projected into descriptor order.
pub fn fingerprint_values(values: &[FieldValue], options: &KeyOptions) -> ChronicleResult<FixedHash> {
    let canonical = canonical_join(values, None, options)?;
    Ok(FixedHash::from_digest_hex(sha256_hex(&canonical)))
}
