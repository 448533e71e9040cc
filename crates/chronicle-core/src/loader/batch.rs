//! Row sets handed to the engine once per load cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AttributeTuple, BusinessKey, FieldValue};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub business_key: BusinessKey,
    #[serde(default)]
    pub attributes: AttributeTuple,
    pub load_time: DateTime<Utc>,
}

/// One snapshot of a source entity type. Rows without an attribute store
/// only register identities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityBatch {
    pub entity_store: String,
    #[serde(default)]
    pub attribute_store: Option<String>,
    pub source_tag: String,
    pub rows: Vec<EntityRow>,
}

impl EntityBatch {
    pub fn new(entity_store: impl Into<String>, source_tag: impl Into<String>) -> Self {
        Self {
            entity_store: entity_store.into(),
            attribute_store: None,
            source_tag: source_tag.into(),
            rows: Vec::new(),
        }
    }

    pub fn with_attribute_store(mut self, attribute_store: impl Into<String>) -> Self {
        self.attribute_store = Some(attribute_store.into());
        self
    }

    pub fn push(&mut self, business_key: BusinessKey, attributes: AttributeTuple, load_time: DateTime<Utc>) {
        self.rows.push(EntityRow {
            business_key,
            attributes,
            load_time,
        });
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRow {
    /// Business keys in the relationship's participant order.
    pub participants: Vec<BusinessKey>,
    /// Discriminator values in definition order.
    #[serde(default)]
    pub attributes: Vec<FieldValue>,
    pub load_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipBatch {
    pub relationship_store: String,
    /// Tracker fed with one observation per row, keyed by its driving role.
    #[serde(default)]
    pub validity_tracker: Option<String>,
    pub source_tag: String,
    pub rows: Vec<RelationshipRow>,
}

impl RelationshipBatch {
    pub fn new(relationship_store: impl Into<String>, source_tag: impl Into<String>) -> Self {
        Self {
            relationship_store: relationship_store.into(),
            validity_tracker: None,
            source_tag: source_tag.into(),
            rows: Vec::new(),
        }
    }

    pub fn with_validity_tracker(mut self, tracker: impl Into<String>) -> Self {
        self.validity_tracker = Some(tracker.into());
        self
    }

    pub fn push(&mut self, participants: Vec<BusinessKey>, attributes: Vec<FieldValue>, load_time: DateTime<Utc>) {
        self.rows.push(RelationshipRow {
            participants,
            attributes,
            load_time,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_batch_deserialises_from_json() {
        let raw = r#"{
            "entity_store": "customer",
            "attribute_store": "customer_details",
            "source_tag": "crm",
            "rows": [{
                "business_key": {"fields": [{"type": "int", "value": 1001}]},
                "attributes": {"name": {"type": "text", "value": "X"}},
                "load_time": "2024-01-01T00:00:00Z"
            }]
        }"#;
        let batch: EntityBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].business_key, BusinessKey::single(1001));
        assert_eq!(batch.rows[0].attributes.get("name"), Some(&FieldValue::from("X")));
    }

    #[test]
    fn relationship_batch_defaults() {
        let raw = r#"{
            "relationship_store": "customer_account",
            "source_tag": "crm",
            "rows": []
        }"#;
        let batch: RelationshipBatch = serde_json::from_str(raw).unwrap();
        assert!(batch.validity_tracker.is_none());
    }
}
