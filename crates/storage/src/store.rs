//! Engine surface: pool and container lifecycle, object update and fetch.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};
use verso_arena::{Arena, ArenaAttrs, MemClass};
use verso_btree::{Btree, BtreeError, KeyBundle, RecordBundle, ValueIo};
use verso_common::{Checksum, ContainerId, Epoch, ObjectId, RecordIndex, SgList};

use crate::cache::lock_ref;
use crate::container::Container;
use crate::context::{ContainerHandle, PoolHandle, VosContext};
use crate::error::StorageError;
use crate::object::ObjectRef;
use crate::pool::{Pool, format_pool};

/// Outcome of a buffered fetch. `copied` bytes landed in the caller's
/// buffer; when `copied < value_len` the buffer truncated the value.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub value_len: u64,
    pub copied: usize,
    pub csum: Option<Checksum>,
}

/// Keys are opaque byte strings up to 2^32 - 1 bytes.
fn check_key_len(name: &str, key: &[u8]) -> Result<(), StorageError> {
    if key.len() as u64 > u64::from(u32::MAX) {
        return Err(StorageError::InvalidArgument(format!("{name} too long")));
    }
    Ok(())
}

impl VosContext {
    // ---- pools ----

    /// Create and format a pool of `capacity` bytes at `path`. Under the
    /// volatile memory class the path only names the pool inside this
    /// context.
    pub fn pool_create(&mut self, path: &Path, capacity: u64) -> Result<(), StorageError> {
        match self.mem_class {
            MemClass::Pmem => {
                let arena = Arena::create(path, capacity)?;
                format_pool(&arena)?;
            }
            MemClass::Vmem => {
                if self.volatile_pools.contains_key(path) {
                    return Err(StorageError::InvalidArgument(format!(
                        "pool {} already exists",
                        path.display()
                    )));
                }
                let arena = Arena::volatile(capacity);
                format_pool(&arena)?;
                self.volatile_pools.insert(path.to_path_buf(), arena);
            }
        }
        info!(path = %path.display(), capacity, "created pool");
        Ok(())
    }

    pub fn pool_open(&mut self, path: &Path) -> Result<PoolHandle, StorageError> {
        let arena = match self.mem_class {
            MemClass::Pmem => match self.pools.values().find(|pool| pool.path == path) {
                // Reopening an already-open pool shares its arena; two
                // independent images of one file would diverge.
                Some(pool) => pool.arena.clone(),
                None => Arena::open(path)?,
            },
            MemClass::Vmem => self
                .volatile_pools
                .get(path)
                .cloned()
                .ok_or_else(|| {
                    StorageError::NotFound(format!("pool {} not found", path.display()))
                })?,
        };

        // A formatted pool carries its container table in the root slot.
        Btree::open_inplace(&arena, arena.root_slot())
            .map_err(|err| match err {
                BtreeError::NotFound => {
                    StorageError::Io(format!("{} is not a formatted pool", path.display()))
                }
                other => other.into(),
            })?
            .close();

        let cookie = self.cookie();
        self.pools.insert(
            cookie,
            Pool {
                arena,
                path: path.to_path_buf(),
            },
        );
        debug!(path = %path.display(), "opened pool");
        Ok(PoolHandle(cookie))
    }

    /// Arena attributes of an open pool: memory class, capacity and bytes
    /// currently allocated to live cells.
    pub fn pool_query(&self, poh: PoolHandle) -> Result<ArenaAttrs, StorageError> {
        Ok(self.pool(poh)?.arena.attrs())
    }

    pub fn pool_close(&mut self, poh: PoolHandle) -> Result<(), StorageError> {
        let pool = self
            .pools
            .remove(&poh.0)
            .ok_or_else(|| StorageError::NotFound(format!("unknown pool handle {:?}", poh)))?;
        pool.arena.persist()?;
        debug!(path = %pool.path.display(), "closed pool");
        Ok(())
    }

    /// Destroy a pool. The pool must have no open handles in this context
    /// and must no longer hold containers.
    pub fn pool_destroy(&mut self, path: &Path) -> Result<(), StorageError> {
        if self.pools.values().any(|pool| pool.path == path) {
            return Err(StorageError::InvalidArgument(format!(
                "pool {} still has open handles",
                path.display()
            )));
        }

        match self.mem_class {
            MemClass::Pmem => {
                let arena = Arena::open(path)?;
                check_pool_empty(&arena)?;
                Arena::unlink(path)?;
            }
            MemClass::Vmem => {
                let arena = self.volatile_pools.get(path).cloned().ok_or_else(|| {
                    StorageError::NotFound(format!("pool {} not found", path.display()))
                })?;
                check_pool_empty(&arena)?;
                self.volatile_pools.remove(path);
            }
        }
        info!(path = %path.display(), "destroyed pool");
        Ok(())
    }

    // ---- containers ----

    pub fn cont_create(&mut self, poh: PoolHandle, cid: ContainerId) -> Result<(), StorageError> {
        let pool = self.pool(poh)?;
        let table = pool.open_cont_table()?;
        let key = KeyBundle {
            key: Some(cid.as_bytes()),
            ..Default::default()
        };
        let mut val = RecordBundle::default();
        match table.insert(&key, &mut val) {
            Ok(()) => {}
            Err(BtreeError::NoPermission(_)) => {
                return Err(StorageError::InvalidArgument(format!(
                    "container {cid} already exists"
                )));
            }
            Err(err) => return Err(err.into()),
        }
        table.close();
        pool.arena.persist()?;
        debug!(%cid, "created container");
        Ok(())
    }

    pub fn cont_open(
        &mut self,
        poh: PoolHandle,
        cid: ContainerId,
    ) -> Result<ContainerHandle, StorageError> {
        let pool = self.pool(poh)?;
        let table = pool.open_cont_table()?;
        let key = KeyBundle {
            key: Some(cid.as_bytes()),
            ..Default::default()
        };
        let mut val = RecordBundle::default();
        table.lookup(&key, &mut val).map_err(|err| match err {
            BtreeError::NotFound => StorageError::NotFound(format!("container {cid}")),
            other => other.into(),
        })?;
        table.close();

        let arena = pool.arena.clone();
        let cookie = self.cookie();
        self.conts.insert(
            cookie,
            Container {
                pool: poh,
                arena,
                cid,
                obj_table_slot: val.subtree_root,
            },
        );
        Ok(ContainerHandle(cookie))
    }

    pub fn cont_close(&mut self, coh: ContainerHandle) -> Result<(), StorageError> {
        let cont = self
            .conts
            .remove(&coh.0)
            .ok_or_else(|| StorageError::NotFound(format!("unknown container handle {:?}", coh)))?;
        // Unwire cached object references that belong to this handle.
        self.ocache.purge_container(coh.0);
        cont.arena.persist()?;
        Ok(())
    }

    /// Destroy a container and everything below it. The container must not
    /// be open in this context.
    pub fn cont_destroy(&mut self, poh: PoolHandle, cid: ContainerId) -> Result<(), StorageError> {
        if self
            .conts
            .values()
            .any(|cont| cont.pool == poh && cont.cid == cid)
        {
            return Err(StorageError::InvalidArgument(format!(
                "container {cid} is open"
            )));
        }

        let pool = self.pool(poh)?;
        let table = pool.open_cont_table()?;
        let key = KeyBundle {
            key: Some(cid.as_bytes()),
            ..Default::default()
        };
        table.delete(&key).map_err(|err| match err {
            BtreeError::NotFound => StorageError::NotFound(format!("container {cid}")),
            other => other.into(),
        })?;
        table.close();
        pool.arena.persist()?;
        info!(%cid, "destroyed container");
        Ok(())
    }

    // ---- objects ----

    /// Find or create the cached reference for an object. With `create`
    /// unset, unknown objects are misses.
    pub(crate) fn hold_object(
        &mut self,
        coh: ContainerHandle,
        oid: ObjectId,
        create: bool,
    ) -> Result<Arc<Mutex<ObjectRef>>, StorageError> {
        let cache_key = (coh.0, oid);
        if let Some(entry) = self.ocache.get(&cache_key) {
            return Ok(entry);
        }

        let cont = self.cont(coh)?;
        let table = cont.open_obj_table()?;
        let oid_bytes = oid.to_bytes();
        let key = KeyBundle {
            key: Some(&oid_bytes),
            ..Default::default()
        };
        let mut val = RecordBundle::default();
        let looked_up = if create {
            table.upsert(&key, &mut val)
        } else {
            table.lookup(&key, &mut val)
        };
        match looked_up {
            Ok(()) => {}
            Err(BtreeError::NotFound) => {
                return Err(StorageError::NotFound(format!("object {oid}")));
            }
            Err(err) => return Err(err.into()),
        }
        table.close();

        let oref = ObjectRef::new(oid, cont.arena.clone(), val.subtree_root);
        Ok(self.ocache.insert(cache_key, oref))
    }

    /// Write one record version: `(dkey, akey, index, epoch) → value`.
    /// The value is the concatenation of the scatter-gather fragments; an
    /// existing `(index, epoch)` record is never overwritten.
    #[allow(clippy::too_many_arguments)]
    pub fn obj_update(
        &mut self,
        coh: ContainerHandle,
        oid: ObjectId,
        dkey: &[u8],
        akey: &[u8],
        index: RecordIndex,
        epoch: Epoch,
        sgl: &SgList,
        csum: Option<Checksum>,
    ) -> Result<(), StorageError> {
        if dkey.is_empty() {
            return Err(StorageError::InvalidArgument(
                "distribution key must not be empty".to_string(),
            ));
        }
        check_key_len("dkey", dkey)?;
        check_key_len("akey", akey)?;

        let value = sgl.to_vec();
        let csum = match csum {
            Some(given) => Some(given),
            None => self
                .checksummer
                .as_mut()
                .and_then(|cs| cs.compute_sgl(sgl)),
        };

        let entry = self.hold_object(coh, oid, true)?;
        let result = (|| -> Result<(), StorageError> {
            let mut oref = lock_ref(&entry);
            oref.tree_init(true)?;

            // Descend: key tree hands back the record's index-tree root.
            let mut kval = RecordBundle::default();
            oref.key_tree()?.upsert(
                &KeyBundle {
                    key: Some(dkey),
                    ..Default::default()
                },
                &mut kval,
            )?;

            let itree = Btree::open_inplace(&oref.arena, kval.subtree_root)?;
            let ikey = KeyBundle {
                index,
                epoch,
                rec_size: value.len() as u64,
                ..Default::default()
            };
            let mut ival = RecordBundle {
                value: ValueIo::Slice(&value),
                csum,
                ..Default::default()
            };
            let inserted = itree.upsert(&ikey, &mut ival);
            itree.close();
            inserted?;
            Ok(())
        })();
        drop(entry);

        match result {
            Ok(()) => {
                self.cont(coh)?.arena.persist()?;
                Ok(())
            }
            Err(err) => {
                if matches!(err, StorageError::NoMemory(_)) {
                    error!(%oid, code = err.code(), %err, "update allocation failed");
                }
                Err(err)
            }
        }
    }

    /// Read one record version into `buf`, truncating when the buffer is
    /// too small; `value_len` in the result carries the full stored size.
    #[allow(clippy::too_many_arguments)]
    pub fn obj_fetch(
        &mut self,
        coh: ContainerHandle,
        oid: ObjectId,
        dkey: &[u8],
        akey: &[u8],
        index: RecordIndex,
        epoch: Epoch,
        buf: &mut [u8],
    ) -> Result<FetchResult, StorageError> {
        check_key_len("dkey", dkey)?;
        check_key_len("akey", akey)?;
        let capacity = buf.len();

        let entry = self.hold_object(coh, oid, false)?;
        let mut oref = lock_ref(&entry);
        oref.tree_init(false)?;

        let mut kval = RecordBundle::default();
        oref.key_tree()?.lookup(
            &KeyBundle {
                key: Some(dkey),
                ..Default::default()
            },
            &mut kval,
        )?;

        let itree = Btree::open_inplace(&oref.arena, kval.subtree_root)?;
        let mut ival = RecordBundle {
            value: ValueIo::Out(buf),
            ..Default::default()
        };
        let fetched = itree.lookup(
            &KeyBundle {
                index,
                epoch,
                ..Default::default()
            },
            &mut ival,
        );
        itree.close();
        fetched?;

        Ok(FetchResult {
            value_len: ival.value_len,
            copied: (capacity as u64).min(ival.value_len) as usize,
            csum: ival.csum,
        })
    }

    /// Convenience fetch returning the value as owned bytes.
    pub fn obj_fetch_value(
        &mut self,
        coh: ContainerHandle,
        oid: ObjectId,
        dkey: &[u8],
        akey: &[u8],
        index: RecordIndex,
        epoch: Epoch,
    ) -> Result<(Vec<u8>, Option<Checksum>), StorageError> {
        check_key_len("dkey", dkey)?;
        check_key_len("akey", akey)?;

        let entry = self.hold_object(coh, oid, false)?;
        let mut oref = lock_ref(&entry);
        oref.tree_init(false)?;

        let mut kval = RecordBundle::default();
        oref.key_tree()?.lookup(
            &KeyBundle {
                key: Some(dkey),
                ..Default::default()
            },
            &mut kval,
        )?;

        let itree = Btree::open_inplace(&oref.arena, kval.subtree_root)?;
        let mut ival = RecordBundle::default();
        let fetched = itree.lookup(
            &KeyBundle {
                index,
                epoch,
                ..Default::default()
            },
            &mut ival,
        );
        itree.close();
        fetched?;

        let value = match ival.value {
            ValueIo::Addr(slice) => oref.arena.read_bytes(slice.handle, slice.off, slice.len)?,
            _ => Vec::new(),
        };
        Ok((value, ival.csum))
    }

    /// Schedule an object for destruction and run the close path: the
    /// zombie reference cascades a destroy of the whole tree stack. The
    /// object becomes "new" again afterwards.
    pub fn obj_destroy(&mut self, coh: ContainerHandle, oid: ObjectId) -> Result<(), StorageError> {
        let entry = self.hold_object(coh, oid, false)?;
        self.ocache.remove(&(coh.0, oid));
        {
            let mut oref = lock_ref(&entry);
            oref.zombie = true;
            oref.tree_fini()?;
        }
        drop(entry);
        self.cont(coh)?.arena.persist()?;
        Ok(())
    }
}

fn check_pool_empty(arena: &Arena) -> Result<(), StorageError> {
    let table = Btree::open_inplace(arena, arena.root_slot())?;
    let empty = table.is_empty()?;
    table.close();
    if !empty {
        return Err(StorageError::NoPermission(
            "pool still holds containers".to_string(),
        ));
    }
    Ok(())
}
