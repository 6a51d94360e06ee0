//! Open container state: a namespace inside a pool, rooted at the object
//! table embedded in its container-table record.

use verso_arena::{Arena, ArenaHandle};
use verso_btree::Btree;
use verso_common::ContainerId;

use crate::context::PoolHandle;
use crate::error::StorageError;

pub(crate) struct Container {
    pub pool: PoolHandle,
    pub arena: Arena,
    pub cid: ContainerId,
    /// Object-table root slot inside the container-table record.
    pub obj_table_slot: ArenaHandle,
}

impl Container {
    pub(crate) fn open_obj_table(&self) -> Result<Btree, StorageError> {
        Ok(Btree::open_inplace(&self.arena, self.obj_table_slot)?)
    }
}
