//! Local versioned object store engine.
//!
//! A pool is one persistent arena on a single target. Inside it, nested
//! B-trees map `(container, object, dkey, akey, index, epoch)` to value
//! records: the pool's container table points at per-container object
//! tables, object records root per-object key trees, and key records root
//! per-key index trees holding the actual versions.
//!
//! The engine is synchronous and context-scoped: callers create a
//! [`VosContext`] per execution context and thread it through every call.
//! Process-wide setup (tree classes, environment configuration) happens in
//! [`init`]/[`fini`].

mod cache;
mod container;
mod context;
mod error;
mod iter;
mod object;
mod pool;
mod store;
mod tree;

pub use context::{ContainerHandle, ENV_CHECKSUM, ENV_MEM_CLASS, PoolHandle, VosContext, fini, init};
pub use error::StorageError;
pub use iter::{IterEntry, IterFilter};
pub use store::FetchResult;
pub use tree::{CLASS_CONTAINER_TABLE, CLASS_INDEX, CLASS_KEY, CLASS_OBJECT_TABLE};

pub use verso_arena::{ArenaAttrs, MemClass};
pub use verso_checksum::ChecksumKind;
pub use verso_common::{Checksum, ContainerId, Epoch, ObjectId, RecordIndex, SgList};
