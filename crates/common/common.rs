//! Shared primitives for the verso storage engine: identifiers,
//! scatter-gather buffers and the key hash used by the on-medium layout.

pub mod hash;
pub mod types;

pub use types::{Checksum, ContainerId, Epoch, ObjectId, RecordIndex, SgList};
