//! Pools: one arena per pool, with the container table rooted in the
//! arena's fixed root slot.

use std::path::PathBuf;

use verso_arena::{Arena, ArenaHandle};
use verso_btree::Btree;

use crate::error::StorageError;
use crate::tree::{CLASS_CONTAINER_TABLE, tree_attr_find};

pub(crate) struct Pool {
    pub arena: Arena,
    pub path: PathBuf,
}

impl Pool {
    pub(crate) fn cont_table_slot(&self) -> ArenaHandle {
        self.arena.root_slot()
    }

    pub(crate) fn open_cont_table(&self) -> Result<Btree, StorageError> {
        Ok(Btree::open_inplace(&self.arena, self.cont_table_slot())?)
    }
}

/// Lay out a fresh pool: create the container table in the arena root slot
/// and make it durable.
pub(crate) fn format_pool(arena: &Arena) -> Result<(), StorageError> {
    let attr = tree_attr_find(CLASS_CONTAINER_TABLE).ok_or_else(|| {
        StorageError::InvalidArgument("container table class not registered".to_string())
    })?;
    Btree::create_inplace(attr.class, attr.feats, attr.order, arena, arena.root_slot())?.close();
    arena.persist()?;
    Ok(())
}
