//! Tree classes wiring the generic B-tree to the engine's record formats.
//!
//! Four classes nest top-down, each record cell embedding the root of the
//! next level:
//!
//! * container table — container id → container record + object table root
//! * object table    — object id → object record + key tree root
//! * key tree        — (dkey, akey) → key record + index tree root
//! * index tree      — (index, epoch) → value record
//!
//! Record cells are length-prefixed by the arena; layouts below describe
//! the payload. All multi-byte fields are little-endian.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use verso_arena::{Arena, ArenaHandle};
use verso_btree::{
    Btree, BtreeError, HKey, KeyBundle, KeyOut, RecordBundle, TREE_ROOT_SIZE, TreeOps, ValueIo,
    register_class,
};
use verso_common::{Checksum, hash::dkey_hash};

use crate::error::StorageError;

/// Class ids, in nesting order: each class's records embed a subtree of
/// the next id. Zero is the sentinel terminating the attribute table.
pub const CLASS_CONTAINER_TABLE: u32 = 1;
pub const CLASS_OBJECT_TABLE: u32 = 2;
pub const CLASS_KEY: u32 = 3;
pub const CLASS_INDEX: u32 = 4;
const CLASS_END: u32 = 0;

/// Default order for every engine tree.
const TREE_ORDER: u16 = 16;

// Identifier-table record: [id 16B][subtree root 24B]
const ID_REC_OFF_ID: u64 = 0;
const ID_REC_OFF_BTR: u64 = 16;
const ID_REC_SIZE: u64 = 16 + TREE_ROOT_SIZE;

// Key record: [key len u32][csum len u16][csum type u16][subtree root 24B]
// then key bytes ‖ csum bytes.
const KREC_OFF_KLEN: u64 = 0;
const KREC_OFF_CSLEN: u64 = 4;
const KREC_OFF_CSTYPE: u64 = 6;
const KREC_OFF_BTR: u64 = 8;
const KREC_HDR: u64 = 8 + TREE_ROOT_SIZE;

// Index record: [value len u64][csum len u16][csum type u16][reserved u32]
// then csum bytes ‖ value bytes.
const IREC_OFF_VLEN: u64 = 0;
const IREC_OFF_CSLEN: u64 = 8;
const IREC_OFF_CSTYPE: u64 = 10;
const IREC_HDR: u64 = 16;

/// Per-class attributes, used for registration and for finding the
/// attributes of a record's subtree level.
pub(crate) struct TreeAttr {
    pub class: u32,
    pub order: u16,
    pub feats: u64,
    pub name: &'static str,
    ops: Option<fn() -> Arc<dyn TreeOps>>,
}

fn cont_table_ops() -> Arc<dyn TreeOps> {
    Arc::new(IdTableOps {
        subtree_class: CLASS_OBJECT_TABLE,
        create_subtree: true,
    })
}

fn obj_table_ops() -> Arc<dyn TreeOps> {
    // The key-tree root stays zeroed until the object is first written,
    // which is how "new" objects are told apart from reopened ones.
    Arc::new(IdTableOps {
        subtree_class: CLASS_KEY,
        create_subtree: false,
    })
}

fn key_tree_ops() -> Arc<dyn TreeOps> {
    Arc::new(KeyTreeOps)
}

fn index_tree_ops() -> Arc<dyn TreeOps> {
    Arc::new(IndexTreeOps)
}

static TREE_ATTRS: &[TreeAttr] = &[
    TreeAttr {
        class: CLASS_CONTAINER_TABLE,
        order: TREE_ORDER,
        feats: 0,
        name: "vs_cont",
        ops: Some(cont_table_ops),
    },
    TreeAttr {
        class: CLASS_OBJECT_TABLE,
        order: TREE_ORDER,
        feats: 0,
        name: "vs_obj",
        ops: Some(obj_table_ops),
    },
    TreeAttr {
        class: CLASS_KEY,
        order: TREE_ORDER,
        feats: 0,
        name: "vs_key",
        ops: Some(key_tree_ops),
    },
    TreeAttr {
        class: CLASS_INDEX,
        order: TREE_ORDER,
        feats: 0,
        name: "vs_idx",
        ops: Some(index_tree_ops),
    },
    TreeAttr {
        class: CLASS_END,
        order: 0,
        feats: 0,
        name: "null",
        ops: None,
    },
];

pub(crate) fn tree_attr_find(class: u32) -> Option<&'static TreeAttr> {
    for attr in TREE_ATTRS {
        if attr.class == class {
            return Some(attr);
        }
        if attr.class == CLASS_END {
            break;
        }
    }
    None
}

/// Register every engine tree class. Safe to call repeatedly.
pub(crate) fn register_tree_classes() -> Result<(), StorageError> {
    for attr in TREE_ATTRS {
        let Some(ops) = attr.ops else {
            break;
        };
        register_class(attr.class, attr.name, ops())?;
        debug!(class = attr.class, name = attr.name, "registered engine tree class");
    }
    Ok(())
}

/// Create the subtree of `class` embedded at `slot`, leaving it closed.
fn create_subtree(arena: &Arena, class: u32, slot: ArenaHandle) -> Result<(), BtreeError> {
    let attr =
        tree_attr_find(class).ok_or(BtreeError::UnknownClass(class))?;
    debug!(name = attr.name, "create subtree");
    Btree::create_inplace(attr.class, attr.feats, attr.order, arena, slot)?.close();
    Ok(())
}

/// Destroy the subtree rooted at `slot` if one was ever formed there.
/// A subtree-destroy failure is fatal to the caller; the outer cell must
/// not be freed past it.
fn destroy_subtree(arena: &Arena, slot: ArenaHandle) -> Result<(), BtreeError> {
    if arena.read_u32(slot, 0)? == 0 {
        return Ok(());
    }
    Btree::open_inplace(arena, slot)?.destroy()
}

fn require_key<'a>(key: &KeyBundle<'a>) -> Result<&'a [u8], BtreeError> {
    key.key
        .ok_or_else(|| BtreeError::InvalidArgument("missing key bytes".to_string()))
}

fn csum_fields(csum: &Option<Checksum>) -> (u16, u16) {
    match csum {
        Some(c) => (c.len() as u16, c.kind),
        None => (0, 0),
    }
}

/// Identifier-keyed table class: 128-bit ids compared as raw bytes, each
/// record carrying only an embedded subtree root. Serves both the
/// container table and the per-container object table.
struct IdTableOps {
    subtree_class: u32,
    /// Whether the subtree is materialized at record allocation or left
    /// for the first user (objects stay "new" until first written).
    create_subtree: bool,
}

impl IdTableOps {
    fn subtree_slot(rec: ArenaHandle) -> ArenaHandle {
        ArenaHandle(rec.0 + ID_REC_OFF_BTR)
    }
}

impl TreeOps for IdTableOps {
    fn hkey_gen(&self, key: &KeyBundle<'_>) -> Result<HKey, BtreeError> {
        let id = require_key(key)?;
        if id.len() != 16 {
            return Err(BtreeError::InvalidArgument(format!(
                "identifier must be 16 bytes, got {}",
                id.len()
            )));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(id);
        Ok(HKey(bytes))
    }

    fn hkey_cmp(&self, rec_hkey: &HKey, hkey: &HKey) -> Ordering {
        // Ids are unique by construction; byte order is the full order.
        rec_hkey.0.cmp(&hkey.0)
    }

    fn rec_alloc(
        &self,
        arena: &Arena,
        key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<ArenaHandle, BtreeError> {
        let id = require_key(key)?;
        let rec = if val.precell.is_null() {
            let rec = arena.alloc(ID_REC_SIZE)?;
            arena.write_bytes(rec, ID_REC_OFF_ID, id)?;
            rec
        } else {
            val.precell
        };

        if self.create_subtree {
            create_subtree(arena, self.subtree_class, Self::subtree_slot(rec))?;
        }
        val.subtree_root = Self::subtree_slot(rec);
        Ok(rec)
    }

    fn rec_free(&self, arena: &Arena, rec: ArenaHandle) -> Result<(), BtreeError> {
        destroy_subtree(arena, Self::subtree_slot(rec))?;
        Ok(arena.free(rec)?)
    }

    fn rec_fetch(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        _hkey: &HKey,
        key_out: Option<&mut KeyOut>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        if let Some(out) = key_out {
            out.key = Some(arena.read_bytes(rec, ID_REC_OFF_ID, 16)?);
        }
        val.subtree_root = Self::subtree_slot(rec);
        Ok(())
    }

    fn rec_update(
        &self,
        _arena: &Arena,
        rec: ArenaHandle,
        _key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        // Nothing to update in the record itself; hand back the subtree.
        val.subtree_root = Self::subtree_slot(rec);
        Ok(())
    }
}

/// Key-tree class: (dkey, akey) → key record with embedded index tree.
/// The attribute key is hashed as zero for now and not stored.
struct KeyTreeOps;

impl KeyTreeOps {
    fn subtree_slot(rec: ArenaHandle) -> ArenaHandle {
        ArenaHandle(rec.0 + KREC_OFF_BTR)
    }
}

impl TreeOps for KeyTreeOps {
    fn hkey_gen(&self, key: &KeyBundle<'_>) -> Result<HKey, BtreeError> {
        let dkey = require_key(key)?;
        Ok(HKey::from_u64_pair(dkey_hash(dkey), 0))
    }

    fn hkey_cmp(&self, rec_hkey: &HKey, hkey: &HKey) -> Ordering {
        rec_hkey.u64_pair().0.cmp(&hkey.u64_pair().0)
    }

    fn key_cmp(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        key: &KeyBundle<'_>,
    ) -> Result<Option<Ordering>, BtreeError> {
        let dkey = require_key(key)?;
        let klen = u64::from(arena.read_u32(rec, KREC_OFF_KLEN)?);
        match klen.cmp(&(dkey.len() as u64)) {
            Ordering::Equal => {
                let stored = arena.read_bytes(rec, KREC_HDR, klen)?;
                Ok(Some(stored.as_slice().cmp(dkey)))
            }
            other => Ok(Some(other)),
        }
    }

    fn rec_alloc(
        &self,
        arena: &Arena,
        key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<ArenaHandle, BtreeError> {
        let rec = if val.precell.is_null() {
            let dkey = require_key(key)?;
            let (cs_len, cs_type) = csum_fields(&val.csum);
            let rec = arena.alloc(KREC_HDR + dkey.len() as u64 + u64::from(cs_len))?;
            arena.write_u32(rec, KREC_OFF_KLEN, dkey.len() as u32)?;
            arena.write_u16(rec, KREC_OFF_CSLEN, cs_len)?;
            arena.write_u16(rec, KREC_OFF_CSTYPE, cs_type)?;
            arena.write_bytes(rec, KREC_HDR, dkey)?;
            if let Some(csum) = &val.csum {
                arena.write_bytes(rec, KREC_HDR + dkey.len() as u64, &csum.bytes)?;
            }
            rec
        } else {
            // Caller-built cell, installed verbatim; the format is not
            // re-validated here.
            val.precell
        };

        arena.write_bytes(rec, KREC_OFF_BTR, &[0u8; TREE_ROOT_SIZE as usize])?;
        create_subtree(arena, CLASS_INDEX, Self::subtree_slot(rec))?;
        val.subtree_root = Self::subtree_slot(rec);
        Ok(rec)
    }

    fn rec_free(&self, arena: &Arena, rec: ArenaHandle) -> Result<(), BtreeError> {
        destroy_subtree(arena, Self::subtree_slot(rec))?;
        Ok(arena.free(rec)?)
    }

    fn rec_fetch(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        _hkey: &HKey,
        key_out: Option<&mut KeyOut>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        val.subtree_root = Self::subtree_slot(rec);
        if let Some(out) = key_out {
            let klen = u64::from(arena.read_u32(rec, KREC_OFF_KLEN)?);
            let cs_len = u64::from(arena.read_u16(rec, KREC_OFF_CSLEN)?);
            out.key = Some(arena.read_bytes(rec, KREC_HDR, klen)?);
            val.csum = if cs_len > 0 {
                let cs_type = arena.read_u16(rec, KREC_OFF_CSTYPE)?;
                let bytes = arena.read_bytes(rec, KREC_HDR + klen, cs_len)?;
                Some(Checksum::new(cs_type, Bytes::from(bytes)))
            } else {
                None
            };
        }
        Ok(())
    }

    fn rec_update(
        &self,
        _arena: &Arena,
        rec: ArenaHandle,
        _key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        // The real update happens in the index subtree; just return its
        // root so the caller can descend.
        val.subtree_root = Self::subtree_slot(rec);
        Ok(())
    }
}

/// Index-tree class: (record index, epoch) → value record. Records are
/// immutable once written; new versions go under a new epoch.
struct IndexTreeOps;

impl IndexTreeOps {
    fn value_off(cs_len: u64) -> u64 {
        IREC_HDR + cs_len
    }
}

impl TreeOps for IndexTreeOps {
    fn hkey_gen(&self, key: &KeyBundle<'_>) -> Result<HKey, BtreeError> {
        Ok(HKey::from_u64_pair(key.index, key.epoch))
    }

    fn hkey_cmp(&self, rec_hkey: &HKey, hkey: &HKey) -> Ordering {
        // Ascending by index, then by epoch.
        rec_hkey.u64_pair().cmp(&hkey.u64_pair())
    }

    fn rec_alloc(
        &self,
        arena: &Arena,
        key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<ArenaHandle, BtreeError> {
        if !val.precell.is_null() {
            return Ok(val.precell);
        }

        let ValueIo::Slice(data) = &val.value else {
            return Err(BtreeError::InvalidArgument(
                "index record requires value bytes".to_string(),
            ));
        };
        if data.len() as u64 != key.rec_size {
            return Err(BtreeError::InvalidArgument(format!(
                "value length {} does not match declared record size {}",
                data.len(),
                key.rec_size
            )));
        }

        let (cs_len, cs_type) = csum_fields(&val.csum);
        let rec = arena.alloc(IREC_HDR + u64::from(cs_len) + data.len() as u64)?;
        arena.write_u64(rec, IREC_OFF_VLEN, data.len() as u64)?;
        arena.write_u16(rec, IREC_OFF_CSLEN, cs_len)?;
        arena.write_u16(rec, IREC_OFF_CSTYPE, cs_type)?;
        if let Some(csum) = &val.csum {
            arena.write_bytes(rec, IREC_HDR, &csum.bytes)?;
        }
        arena.write_bytes(rec, Self::value_off(u64::from(cs_len)), data)?;
        Ok(rec)
    }

    fn rec_free(&self, arena: &Arena, rec: ArenaHandle) -> Result<(), BtreeError> {
        Ok(arena.free(rec)?)
    }

    fn rec_fetch(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        hkey: &HKey,
        key_out: Option<&mut KeyOut>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        let vlen = arena.read_u64(rec, IREC_OFF_VLEN)?;
        let cs_len = u64::from(arena.read_u16(rec, IREC_OFF_CSLEN)?);

        if let Some(out) = key_out {
            let (index, epoch) = hkey.u64_pair();
            out.index = index;
            out.epoch = epoch;
            out.rec_size = vlen;
        }

        val.value_len = vlen;
        val.csum = if cs_len > 0 {
            let cs_type = arena.read_u16(rec, IREC_OFF_CSTYPE)?;
            let bytes = arena.read_bytes(rec, IREC_HDR, cs_len)?;
            Some(Checksum::new(cs_type, Bytes::from(bytes)))
        } else {
            None
        };

        match &mut val.value {
            ValueIo::Out(buf) => {
                // Copy what fits; value_len tells the caller whether the
                // buffer truncated the value.
                let n = (buf.len() as u64).min(vlen);
                arena.read_into(rec, Self::value_off(cs_len), &mut buf[..n as usize])?;
            }
            other => {
                *other = ValueIo::Addr(verso_btree::ArenaSlice {
                    handle: rec,
                    off: Self::value_off(cs_len),
                    len: vlen,
                });
            }
        }
        Ok(())
    }

    fn rec_update(
        &self,
        _arena: &Arena,
        _rec: ArenaHandle,
        _key: &KeyBundle<'_>,
        _val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        debug!("rejected overwrite of an existing index/epoch record");
        Err(BtreeError::NoPermission(
            "record versions are immutable; write under a new epoch".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verso_arena::Arena;
    use verso_btree::ArenaSlice;

    fn setup() -> Arena {
        register_tree_classes().expect("register");
        Arena::volatile(4 << 20)
    }

    #[test]
    fn key_record_layout_round_trip() {
        let arena = setup();
        let ops = KeyTreeOps;

        let key = KeyBundle {
            key: Some(b"dkey-one"),
            ..Default::default()
        };
        let csum = Checksum::new(2, Bytes::from_static(&[0xAB; 8]));
        let mut val = RecordBundle {
            csum: Some(csum.clone()),
            ..Default::default()
        };
        let rec = ops.rec_alloc(&arena, &key, &mut val).expect("alloc");
        assert!(!val.subtree_root.is_null());

        let hkey = ops.hkey_gen(&key).expect("hkey");
        let mut out = KeyOut::default();
        let mut fetched = RecordBundle::default();
        ops.rec_fetch(&arena, rec, &hkey, Some(&mut out), &mut fetched)
            .expect("fetch");

        assert_eq!(out.key.as_deref(), Some(b"dkey-one".as_slice()));
        assert_eq!(fetched.csum, Some(csum));
        assert_eq!(fetched.subtree_root, val.subtree_root);

        // tie-breaking against the stored key bytes
        assert_eq!(
            ops.key_cmp(&arena, rec, &key).expect("cmp"),
            Some(Ordering::Equal)
        );
        let smaller = KeyBundle {
            key: Some(b"dkey"),
            ..Default::default()
        };
        assert_eq!(
            ops.key_cmp(&arena, rec, &smaller).expect("cmp"),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn key_record_subtree_is_formed() {
        let arena = setup();
        let ops = KeyTreeOps;
        let key = KeyBundle {
            key: Some(b"d"),
            ..Default::default()
        };
        let mut val = RecordBundle::default();
        ops.rec_alloc(&arena, &key, &mut val).expect("alloc");

        let sub = Btree::open_inplace(&arena, val.subtree_root).expect("open subtree");
        assert_eq!(sub.class(), CLASS_INDEX);
        assert!(sub.is_empty().expect("empty"));
    }

    #[test]
    fn index_record_rejects_size_mismatch_and_overwrite() {
        let arena = setup();
        let ops = IndexTreeOps;

        let key = KeyBundle {
            index: 0,
            epoch: 1,
            rec_size: 4,
            ..Default::default()
        };
        let mut val = RecordBundle::for_update(b"xx", None);
        assert!(matches!(
            ops.rec_alloc(&arena, &key, &mut val),
            Err(BtreeError::InvalidArgument(_))
        ));

        let mut val = RecordBundle::for_update(b"data", None);
        let rec = ops.rec_alloc(&arena, &key, &mut val).expect("alloc");

        let mut val = RecordBundle::for_update(b"data", None);
        assert!(matches!(
            ops.rec_update(&arena, rec, &key, &mut val),
            Err(BtreeError::NoPermission(_))
        ));
    }

    #[test]
    fn index_record_fetch_truncates_to_buffer() {
        let arena = setup();
        let ops = IndexTreeOps;
        let key = KeyBundle {
            index: 7,
            epoch: 3,
            rec_size: 8,
            ..Default::default()
        };
        let mut val = RecordBundle::for_update(b"longdata", None);
        let rec = ops.rec_alloc(&arena, &key, &mut val).expect("alloc");
        let hkey = ops.hkey_gen(&key).expect("hkey");

        let mut short = [0u8; 4];
        let mut out = RecordBundle {
            value: ValueIo::Out(&mut short),
            ..Default::default()
        };
        ops.rec_fetch(&arena, rec, &hkey, None, &mut out).expect("fetch");
        assert_eq!(out.value_len, 8);
        assert_eq!(&short, b"long");

        let mut addr = RecordBundle::default();
        ops.rec_fetch(&arena, rec, &hkey, None, &mut addr).expect("fetch");
        let ValueIo::Addr(ArenaSlice { handle, off, len }) = addr.value else {
            panic!("expected address return");
        };
        assert_eq!(
            arena.read_bytes(handle, off, len).expect("read"),
            b"longdata"
        );
    }

    #[test]
    fn index_hkey_orders_by_index_then_epoch() {
        let ops = IndexTreeOps;
        let k = |index, epoch| HKey::from_u64_pair(index, epoch);
        assert_eq!(ops.hkey_cmp(&k(0, 5), &k(1, 0)), Ordering::Less);
        assert_eq!(ops.hkey_cmp(&k(1, 0), &k(1, 1)), Ordering::Less);
        assert_eq!(ops.hkey_cmp(&k(2, 1), &k(1, 9)), Ordering::Greater);
        assert_eq!(ops.hkey_cmp(&k(3, 3), &k(3, 3)), Ordering::Equal);
    }

    #[test]
    fn id_table_cascades_into_subtrees() {
        let arena = setup();
        let baseline = arena.live_bytes();

        let table = Btree::create_inplace(
            CLASS_CONTAINER_TABLE,
            0,
            TREE_ORDER,
            &arena,
            arena.root_slot(),
        )
        .expect("create");

        let id = [9u8; 16];
        let key = KeyBundle {
            key: Some(&id),
            ..Default::default()
        };
        let mut val = RecordBundle::default();
        table.upsert(&key, &mut val).expect("insert");

        // container records materialize their object table eagerly
        let sub = Btree::open_inplace(&arena, val.subtree_root).expect("open");
        assert_eq!(sub.class(), CLASS_OBJECT_TABLE);
        sub.close();

        table.destroy().expect("destroy");
        assert_eq!(arena.live_bytes(), baseline);
    }
}
