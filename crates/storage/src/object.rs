//! Open object references and the tree stack behind them.
//!
//! An object's persistent root is the key-tree slot inside its
//! object-table record. The reference lazily opens (or, on first write,
//! creates) that tree and keeps the handle for reuse across operations.

use tracing::debug;
use verso_arena::{Arena, ArenaHandle};
use verso_btree::Btree;
use verso_common::ObjectId;

use crate::error::StorageError;
use crate::tree::{CLASS_KEY, tree_attr_find};

pub(crate) struct ObjectRef {
    pub oid: ObjectId,
    pub arena: Arena,
    /// Key-tree root slot inside the object-table record.
    pub key_tree_slot: ArenaHandle,
    /// Open key tree, shared by every operation on this reference.
    pub toh: Option<Btree>,
    /// Scheduled for destruction; the close path cascades a destroy.
    pub zombie: bool,
}

impl ObjectRef {
    pub(crate) fn new(oid: ObjectId, arena: Arena, key_tree_slot: ArenaHandle) -> ObjectRef {
        ObjectRef {
            oid,
            arena,
            key_tree_slot,
            toh: None,
            zombie: false,
        }
    }

    fn root_is_formed(&self) -> Result<bool, StorageError> {
        Ok(self.arena.read_u32(self.key_tree_slot, 0)? != 0)
    }

    /// Open the object's key tree, creating it on first write. An object
    /// stays "new" (unformed root) until someone writes to it; fetches on
    /// a new object are misses.
    pub(crate) fn tree_init(&mut self, create: bool) -> Result<(), StorageError> {
        if self.toh.is_some() {
            return Ok(());
        }

        let tree = if self.root_is_formed()? {
            debug!(oid = %self.oid, "open tree for object");
            Btree::open_inplace(&self.arena, self.key_tree_slot)?
        } else if create {
            let attr = tree_attr_find(CLASS_KEY).ok_or_else(|| {
                StorageError::InvalidArgument("key tree class not registered".to_string())
            })?;
            debug!(oid = %self.oid, "create tree for object");
            Btree::create_inplace(
                attr.class,
                attr.feats,
                attr.order,
                &self.arena,
                self.key_tree_slot,
            )?
        } else {
            return Err(StorageError::NotFound(format!(
                "object {} holds no data",
                self.oid
            )));
        };

        self.toh = Some(tree);
        Ok(())
    }

    pub(crate) fn key_tree(&self) -> Result<&Btree, StorageError> {
        self.toh
            .as_ref()
            .ok_or_else(|| StorageError::NotFound(format!("object {} is not open", self.oid)))
    }

    /// Close the reference's tree stack: a plain close unwires the handle,
    /// a zombie reference destroys the whole tree.
    pub(crate) fn tree_fini(&mut self) -> Result<(), StorageError> {
        if self.zombie {
            if self.toh.is_none() && self.root_is_formed()? {
                self.toh = Some(Btree::open_inplace(&self.arena, self.key_tree_slot)?);
            }
            if let Some(tree) = self.toh.take() {
                tree.destroy()?;
            }
        } else if let Some(tree) = self.toh.take() {
            tree.close();
        }
        Ok(())
    }
}
