//! Pure, deterministic hashing: business-key canonicalisation, surrogate key
//! derivation, and attribute fingerprinting.

pub mod canonical;
pub mod fingerprint;
pub mod keys;

pub use canonical::KeyOptions;
pub use fingerprint::{fingerprint, SchemaDescriptor};
pub use keys::{derive_key, derive_relationship_key};
