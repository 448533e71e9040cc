//! Chronicle core library: an append-only historization engine.
//!
//! Periodic full snapshots of business entities and their relationships are
//! turned into a durable, auditable history of identity and attribute
//! change. The crate provides deterministic surrogate keys, change detection
//! by content hashing, current-flag and end-date maintenance, relationship
//! validity intervals, point-in-time projection, and sentinel records, all
//! persisted in a single SQLite vault.

pub mod config;
pub mod errors;
pub mod hashing;
pub mod history;
pub mod loader;
pub mod models;
pub mod store;

pub use config::{ChronicleConfig, OrphanPolicy, PitMissingPolicy, TieBreakPolicy};
pub use errors::{ChronicleError, ChronicleResult};
pub use hashing::{derive_key, derive_relationship_key, fingerprint, KeyOptions, SchemaDescriptor};
pub use history::SnapshotGrid;
pub use loader::{run_entity_cycle, run_relationship_cycle, EntityBatch, LoadReport, RelationshipBatch};
pub use models::{
    AttributeTuple, AttributeVersion, BusinessKey, EntityRecord, FieldValue, FixedHash, PitRow,
    RelationshipRecord, ValidityInterval,
};
pub use store::attributes::{AppendOutcome, AttributeStore, ReconcileSummary};
pub use store::database::Vault;
pub use store::entity::EntityStore;
pub use store::pit::{PitProjector, PitSummary};
pub use store::registry::{ParticipantDef, RelationshipDefinition, StoreKind};
pub use store::relationship::{LinkOutcome, RelationshipStore};
pub use store::sentinel::SentinelSummary;
pub use store::validity::{Observation, ObservationOutcome, ValidityTracker};
