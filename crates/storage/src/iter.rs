//! Object iteration: walk an object's distribution keys, or the record
//! versions under one key, in tree order.

use verso_btree::{Btree, KeyBundle, KeyOut, RecordBundle};
use verso_common::{Checksum, Epoch, ObjectId, RecordIndex};

use crate::cache::lock_ref;
use crate::context::{ContainerHandle, VosContext};
use crate::error::StorageError;

/// What to walk.
#[derive(Debug, Clone, Copy)]
pub enum IterFilter<'a> {
    /// Every distribution key of the object, in ascending hash order.
    Dkeys,
    /// Every `(index, epoch)` record under one distribution key, in
    /// ascending `(index, epoch)` order.
    Records { dkey: &'a [u8] },
}

/// One visited entry.
#[derive(Debug, Clone)]
pub enum IterEntry {
    Dkey {
        key: Vec<u8>,
        csum: Option<Checksum>,
    },
    Record {
        index: RecordIndex,
        epoch: Epoch,
        value_len: u64,
        csum: Option<Checksum>,
    },
}

impl VosContext {
    /// Visit the object's entries selected by `filter`. The visitor
    /// returns `false` to stop early.
    pub fn obj_iterate(
        &mut self,
        coh: ContainerHandle,
        oid: ObjectId,
        filter: IterFilter<'_>,
        visit: &mut dyn FnMut(IterEntry) -> bool,
    ) -> Result<(), StorageError> {
        let entry = self.hold_object(coh, oid, false)?;
        let mut oref = lock_ref(&entry);
        oref.tree_init(false)?;
        let ktree = oref.key_tree()?;

        match filter {
            IterFilter::Dkeys => {
                ktree.iterate(&mut |hkey, rec| {
                    let mut out = KeyOut::default();
                    let mut val = RecordBundle::default();
                    ktree.fetch_record(hkey, rec, Some(&mut out), &mut val)?;
                    let key = out.key.unwrap_or_default();
                    Ok(visit(IterEntry::Dkey {
                        key,
                        csum: val.csum.take(),
                    }))
                })?;
            }
            IterFilter::Records { dkey } => {
                let mut kval = RecordBundle::default();
                ktree.lookup(
                    &KeyBundle {
                        key: Some(dkey),
                        ..Default::default()
                    },
                    &mut kval,
                )?;
                let itree = Btree::open_inplace(&oref.arena, kval.subtree_root)?;
                let walked = itree.iterate(&mut |hkey, rec| {
                    let mut out = KeyOut::default();
                    let mut val = RecordBundle::default();
                    itree.fetch_record(hkey, rec, Some(&mut out), &mut val)?;
                    Ok(visit(IterEntry::Record {
                        index: out.index,
                        epoch: out.epoch,
                        value_len: out.rec_size,
                        csum: val.csum.take(),
                    }))
                });
                itree.close();
                walked?;
            }
        }
        Ok(())
    }
}
