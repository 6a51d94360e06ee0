//! Bounded cache of open object references.
//!
//! One reference per `(container handle, object id)` key; holders share it
//! through an `Arc`, so the strong count doubles as the reference count.
//! Only idle entries (no outside holders) are evicted, and eviction runs
//! the reference's close path.

use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use rustc_hash::FxBuildHasher;
use tracing::error;
use verso_common::ObjectId;

use crate::object::ObjectRef;

/// Cache capacity as a power of two.
pub(crate) const OBJ_CACHE_BITS: u32 = 16;

pub(crate) type ObjectKey = (u64, ObjectId);

pub(crate) fn lock_ref(entry: &Arc<Mutex<ObjectRef>>) -> MutexGuard<'_, ObjectRef> {
    match entry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct ObjectCache {
    lru: LruCache<ObjectKey, Arc<Mutex<ObjectRef>>, FxBuildHasher>,
    capacity: usize,
}

impl ObjectCache {
    pub(crate) fn new(bits: u32) -> ObjectCache {
        ObjectCache {
            lru: LruCache::unbounded_with_hasher(FxBuildHasher),
            capacity: 1usize << bits,
        }
    }

    pub(crate) fn get(&mut self, key: &ObjectKey) -> Option<Arc<Mutex<ObjectRef>>> {
        self.lru.get(key).cloned()
    }

    /// Insert a freshly built reference, or return the existing one so a
    /// key never has two live references at once.
    pub(crate) fn insert(&mut self, key: ObjectKey, oref: ObjectRef) -> Arc<Mutex<ObjectRef>> {
        if let Some(existing) = self.lru.get(&key) {
            return existing.clone();
        }
        let entry = Arc::new(Mutex::new(oref));
        self.lru.put(key, entry.clone());
        self.evict_idle();
        entry
    }

    pub(crate) fn remove(&mut self, key: &ObjectKey) -> Option<Arc<Mutex<ObjectRef>>> {
        self.lru.pop(key)
    }

    /// Drop every entry belonging to a container handle, closing each
    /// reference's tree stack.
    pub(crate) fn purge_container(&mut self, cont_cookie: u64) {
        let keys: Vec<ObjectKey> = self
            .lru
            .iter()
            .filter(|(key, _)| key.0 == cont_cookie)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(entry) = self.lru.pop(&key) {
                close_entry(&entry);
            }
        }
    }

    /// Evict least-recently-used idle entries until within capacity.
    /// Entries still held elsewhere are kept.
    fn evict_idle(&mut self) {
        let mut busy = Vec::new();
        while self.lru.len() + busy.len() > self.capacity {
            let Some((key, entry)) = self.lru.pop_lru() else {
                break;
            };
            if Arc::strong_count(&entry) > 1 {
                busy.push((key, entry));
                continue;
            }
            close_entry(&entry);
        }
        for (key, entry) in busy {
            self.lru.put(key, entry);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lru.len()
    }
}

fn close_entry(entry: &Arc<Mutex<ObjectRef>>) {
    let mut oref = lock_ref(entry);
    if let Err(err) = oref.tree_fini() {
        error!(oid = %oref.oid, %err, "failed to close evicted object reference");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verso_arena::Arena;

    fn make_ref(arena: &Arena, lo: u64) -> ObjectRef {
        ObjectRef::new(ObjectId::new(0, lo), arena.clone(), arena.root_slot())
    }

    #[test]
    fn one_reference_per_key() {
        let arena = Arena::volatile(1 << 20);
        let mut cache = ObjectCache::new(4);
        let key = (1u64, ObjectId::new(0, 1));

        let first = cache.insert(key, make_ref(&arena, 1));
        let second = cache.insert(key, make_ref(&arena, 1));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &cache.get(&key).expect("cached")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_skips_held_references() {
        let arena = Arena::volatile(1 << 20);
        // capacity 2
        let mut cache = ObjectCache::new(1);

        let held_key = (1u64, ObjectId::new(0, 1));
        let held = cache.insert(held_key, make_ref(&arena, 1));
        for lo in 2..10u64 {
            cache.insert((1, ObjectId::new(0, lo)), make_ref(&arena, lo));
        }

        assert!(cache.len() <= 3, "capacity plus held entries");
        assert!(
            cache.get(&held_key).is_some(),
            "held reference must not be evicted"
        );
        drop(held);
    }

    #[test]
    fn purge_removes_only_matching_container() {
        let arena = Arena::volatile(1 << 20);
        let mut cache = ObjectCache::new(4);
        cache.insert((1, ObjectId::new(0, 1)), make_ref(&arena, 1));
        cache.insert((2, ObjectId::new(0, 1)), make_ref(&arena, 1));

        cache.purge_container(1);
        assert!(cache.get(&(1, ObjectId::new(0, 1))).is_none());
        assert!(cache.get(&(2, ObjectId::new(0, 1))).is_some());
    }
}
