//! Tree-core tests against a minimal blob class: u64 keys, inline byte
//! payloads, overwrite allowed only when the size matches.

use std::cmp::Ordering;
use std::sync::Arc;

use verso_arena::{Arena, ArenaHandle};

use super::*;

const TEST_CLASS: u32 = 200;
const ORDER: u16 = 5;

const OFF_LEN: u64 = 0;
const OFF_DATA: u64 = 8;

struct BlobOps;

impl TreeOps for BlobOps {
    fn hkey_gen(&self, key: &KeyBundle<'_>) -> Result<HKey, BtreeError> {
        Ok(HKey::from_u64_pair(key.index, 0))
    }

    fn hkey_cmp(&self, rec_hkey: &HKey, hkey: &HKey) -> Ordering {
        rec_hkey.u64_pair().0.cmp(&hkey.u64_pair().0)
    }

    fn rec_alloc(
        &self,
        arena: &Arena,
        _key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<ArenaHandle, BtreeError> {
        let ValueIo::Slice(data) = &val.value else {
            return Err(BtreeError::InvalidArgument("missing value".to_string()));
        };
        let rec = arena.alloc(OFF_DATA + data.len() as u64)?;
        arena.write_u64(rec, OFF_LEN, data.len() as u64)?;
        arena.write_bytes(rec, OFF_DATA, data)?;
        Ok(rec)
    }

    fn rec_free(&self, arena: &Arena, rec: ArenaHandle) -> Result<(), BtreeError> {
        Ok(arena.free(rec)?)
    }

    fn rec_fetch(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        _hkey: &HKey,
        _key_out: Option<&mut KeyOut>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        let len = arena.read_u64(rec, OFF_LEN)?;
        val.value_len = len;
        match &mut val.value {
            ValueIo::Out(buf) => {
                let n = (buf.len() as u64).min(len) as usize;
                arena.read_into(rec, OFF_DATA, &mut buf[..n])?;
            }
            other => {
                *other = ValueIo::Addr(ArenaSlice {
                    handle: rec,
                    off: OFF_DATA,
                    len,
                });
            }
        }
        Ok(())
    }

    fn rec_update(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        _key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        let ValueIo::Slice(data) = &val.value else {
            return Err(BtreeError::InvalidArgument("missing value".to_string()));
        };
        let len = arena.read_u64(rec, OFF_LEN)?;
        if len != data.len() as u64 {
            return Err(BtreeError::NoPermission(
                "size-changing overwrite".to_string(),
            ));
        }
        arena.write_bytes(rec, OFF_DATA, data)?;
        Ok(())
    }
}

fn register() {
    register_class(TEST_CLASS, "blob", Arc::new(BlobOps)).expect("register");
}

fn new_tree(arena: &Arena) -> Btree {
    register();
    Btree::create_inplace(TEST_CLASS, 0, ORDER, arena, arena.root_slot()).expect("create")
}

fn key(index: u64) -> KeyBundle<'static> {
    KeyBundle {
        index,
        ..Default::default()
    }
}

fn put(tree: &Btree, index: u64, data: &[u8]) -> Result<(), BtreeError> {
    let mut val = RecordBundle::for_update(data, None);
    tree.upsert(&key(index), &mut val)
}

fn get(tree: &Btree, index: u64, buf: &mut [u8]) -> Result<u64, BtreeError> {
    let mut val = RecordBundle {
        value: ValueIo::Out(buf),
        ..Default::default()
    };
    tree.lookup(&key(index), &mut val)?;
    Ok(val.value_len)
}

#[test]
fn insert_and_lookup_many() {
    let arena = Arena::volatile(4 << 20);
    let tree = new_tree(&arena);

    // visit keys in a scrambled but deterministic order
    for i in 0..200u64 {
        let k = (i * 119) % 200;
        let data = vec![(k % 251) as u8; 16];
        put(&tree, k, &data).expect("insert");
    }

    let mut buf = [0u8; 16];
    for k in 0..200u64 {
        let len = get(&tree, k, &mut buf).expect("lookup");
        assert_eq!(len, 16);
        assert_eq!(buf, [(k % 251) as u8; 16], "value mismatch for key {k}");
    }
}

#[test]
fn lookup_miss_is_not_found() {
    let arena = Arena::volatile(1 << 20);
    let tree = new_tree(&arena);
    put(&tree, 1, b"one").expect("insert");

    let mut buf = [0u8; 8];
    assert!(matches!(
        get(&tree, 2, &mut buf),
        Err(BtreeError::NotFound)
    ));
}

#[test]
fn iteration_is_ordered() {
    let arena = Arena::volatile(4 << 20);
    let tree = new_tree(&arena);

    for i in 0..100u64 {
        let k = (i * 37) % 100;
        put(&tree, k, b"x").expect("insert");
    }

    let mut seen = Vec::new();
    tree.iterate(&mut |hkey, _| {
        seen.push(hkey.u64_pair().0);
        Ok(true)
    })
    .expect("iterate");

    assert_eq!(seen.len(), 100);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "not ascending: {seen:?}");
}

#[test]
fn strict_insert_rejects_duplicates() {
    let arena = Arena::volatile(1 << 20);
    let tree = new_tree(&arena);

    let mut val = RecordBundle::for_update(b"aaaa", None);
    tree.insert(&key(9), &mut val).expect("first insert");

    let mut val = RecordBundle::for_update(b"bbbb", None);
    assert!(matches!(
        tree.insert(&key(9), &mut val),
        Err(BtreeError::NoPermission(_))
    ));
}

#[test]
fn upsert_overwrites_in_place() {
    let arena = Arena::volatile(1 << 20);
    let tree = new_tree(&arena);

    put(&tree, 5, b"before").expect("insert");
    put(&tree, 5, b"after!").expect("overwrite");

    let mut buf = [0u8; 6];
    let len = get(&tree, 5, &mut buf).expect("lookup");
    assert_eq!(len, 6);
    assert_eq!(&buf, b"after!");

    // the class rejects size-changing overwrites
    assert!(matches!(
        put(&tree, 5, b"longer value"),
        Err(BtreeError::NoPermission(_))
    ));
}

#[test]
fn fetch_without_buffer_returns_address() {
    let arena = Arena::volatile(1 << 20);
    let tree = new_tree(&arena);
    put(&tree, 3, b"payload").expect("insert");

    let mut val = RecordBundle::default();
    tree.lookup(&key(3), &mut val).expect("lookup");
    assert_eq!(val.value_len, 7);
    let ValueIo::Addr(slice) = &val.value else {
        panic!("expected address return");
    };
    assert_eq!(
        arena
            .read_bytes(slice.handle, slice.off, slice.len)
            .expect("read"),
        b"payload"
    );
}

#[test]
fn destroy_returns_arena_to_baseline() {
    let arena = Arena::volatile(4 << 20);
    let baseline = arena.live_bytes();

    let tree = new_tree(&arena);
    for k in 0..64u64 {
        put(&tree, k, &vec![7u8; 32]).expect("insert");
    }
    assert!(arena.live_bytes() > baseline);

    tree.destroy().expect("destroy");
    assert_eq!(arena.live_bytes(), baseline);

    // root slot is back to unused
    assert!(matches!(
        Btree::open_inplace(&arena, arena.root_slot()),
        Err(BtreeError::NotFound)
    ));
}

#[test]
fn delete_removes_single_records() {
    let arena = Arena::volatile(4 << 20);
    let tree = new_tree(&arena);

    for k in 0..50u64 {
        put(&tree, k, b"v").expect("insert");
    }
    for k in (0..50u64).step_by(5) {
        tree.delete(&key(k)).expect("delete");
    }

    let mut buf = [0u8; 1];
    for k in 0..50u64 {
        let found = get(&tree, k, &mut buf);
        if k % 5 == 0 {
            assert!(matches!(found, Err(BtreeError::NotFound)), "key {k}");
        } else {
            assert_eq!(found.expect("lookup"), 1, "key {k}");
        }
    }
    assert_eq!(tree.record_count().expect("count"), 40);

    assert!(matches!(
        tree.delete(&key(0)),
        Err(BtreeError::NotFound)
    ));
}

#[test]
fn reopen_after_persist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tree.pool");

    {
        let arena = Arena::create(&path, 4 << 20).expect("create arena");
        let tree = new_tree(&arena);
        for k in 0..32u64 {
            put(&tree, k, &k.to_le_bytes()).expect("insert");
        }
        tree.close();
        arena.persist().expect("persist");
    }

    let arena = Arena::open(&path).expect("open arena");
    register();
    let tree = Btree::open_inplace(&arena, arena.root_slot()).expect("open tree");
    let mut buf = [0u8; 8];
    for k in 0..32u64 {
        let len = get(&tree, k, &mut buf).expect("lookup");
        assert_eq!(len, 8);
        assert_eq!(buf, k.to_le_bytes());
    }
}

#[test]
fn create_requires_registered_class() {
    let arena = Arena::volatile(1 << 20);
    assert!(matches!(
        Btree::create_inplace(4242, 0, ORDER, &arena, arena.root_slot()),
        Err(BtreeError::UnknownClass(4242))
    ));
}

#[test]
fn create_rejects_occupied_root_slot() {
    let arena = Arena::volatile(1 << 20);
    let tree = new_tree(&arena);
    put(&tree, 1, b"x").expect("insert");

    assert!(matches!(
        Btree::create_inplace(TEST_CLASS, 0, ORDER, &arena, arena.root_slot()),
        Err(BtreeError::InvalidArgument(_))
    ));
}
