//! Pure history computations. Nothing here touches storage: each function
//! maps the rows it is given to a decision or a set of updates, which the
//! store layer then applies as one write set.

pub mod dedup;
pub mod pit;
pub mod reconcile;
pub mod snapshots;
pub mod validity;

pub use dedup::{decide_append, AppendDecision, KnownVersion};
pub use pit::{pit_digest, project, VersionPoint};
pub use reconcile::{plan_current_flags, FlagUpdate, VersionSlot};
pub use snapshots::SnapshotGrid;
pub use validity::{next_transition, ActiveInterval, Transition};
