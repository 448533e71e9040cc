//! Load cycles: turning a source snapshot into appends and maintenance.

pub mod audit;
pub mod batch;
pub mod pipeline;

pub use audit::{load_report, recent_cycles, rejections, summarize_rejections, CycleRecord, LoadReport, RejectedRow};
pub use batch::{EntityBatch, EntityRow, RelationshipBatch, RelationshipRow};
pub use pipeline::{run_entity_cycle, run_relationship_cycle};
