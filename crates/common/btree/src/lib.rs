//! Generic ordered map over an arena, parameterised by a tree class.
//!
//! A class supplies key hashing, comparison and record-cell management; the
//! tree core only ever sees 16-byte hashed keys and opaque record handles.
//! Tree roots are 24-byte descriptors embedded in a parent cell, so trees
//! nest: a record cell of one tree can carry the root of another. Classes
//! are registered process-wide by id before any tree of that class is
//! created or opened.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use lazy_static::lazy_static;
use tracing::{debug, error};
use verso_arena::{Arena, ArenaError, ArenaHandle};
use verso_common::Checksum;

mod node;
use node::NodeView;

/// Width of the hashed-key slot in every record.
pub const HKEY_SIZE: usize = 16;

/// Size of an embedded tree-root descriptor.
pub const TREE_ROOT_SIZE: u64 = 24;

const ROOT_OFF_CLASS: u64 = 0;
const ROOT_OFF_ORDER: u64 = 4;
const ROOT_OFF_DEPTH: u64 = 6;
const ROOT_OFF_FEATS: u64 = 8;
const ROOT_OFF_NODE: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum BtreeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no permission: {0}")]
    NoPermission(String),

    #[error("record not found")]
    NotFound,

    #[error("unknown tree class {0}")]
    UnknownClass(u32),

    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Fixed-width comparison key stored inline in each record slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HKey(pub [u8; HKEY_SIZE]);

impl HKey {
    pub const ZERO: HKey = HKey([0u8; HKEY_SIZE]);

    /// `[lo LE ‖ hi LE]`.
    pub fn from_u64_pair(lo: u64, hi: u64) -> Self {
        let mut bytes = [0u8; HKEY_SIZE];
        bytes[..8].copy_from_slice(&lo.to_le_bytes());
        bytes[8..].copy_from_slice(&hi.to_le_bytes());
        HKey(bytes)
    }

    pub fn u64_pair(&self) -> (u64, u64) {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        hi.copy_from_slice(&self.0[8..]);
        (u64::from_le_bytes(lo), u64::from_le_bytes(hi))
    }
}

impl std::fmt::Debug for HKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (lo, hi) = self.u64_pair();
        write!(f, "HKey({lo:#x},{hi:#x})")
    }
}

/// Logical key presented to class callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyBundle<'a> {
    /// Key bytes (distribution key, identifier) when the class keys on
    /// byte strings.
    pub key: Option<&'a [u8]>,
    /// Record index for index-keyed classes.
    pub index: u64,
    /// Epoch for index-keyed classes.
    pub epoch: u64,
    /// Declared record size; classes may validate payloads against it.
    pub rec_size: u64,
}

/// Key fields filled back out of a record during iteration.
#[derive(Debug, Clone, Default)]
pub struct KeyOut {
    pub key: Option<Vec<u8>>,
    pub index: u64,
    pub epoch: u64,
    pub rec_size: u64,
}

/// Location of value bytes inside the arena.
#[derive(Debug, Clone, Copy)]
pub struct ArenaSlice {
    pub handle: ArenaHandle,
    pub off: u64,
    pub len: u64,
}

/// Value payload travelling through class callbacks.
///
/// On update, `Slice` carries the bytes to store. On fetch, `Out` asks for
/// a copy into the caller's buffer (truncated to the buffer, the bundle's
/// `value_len` reports the full stored size) and `None` asks for the
/// in-arena address, returned as `Addr`.
#[derive(Debug, Default)]
pub enum ValueIo<'a> {
    #[default]
    None,
    Slice(&'a [u8]),
    Out(&'a mut [u8]),
    Addr(ArenaSlice),
}

/// Record payload bundle passed in and out of class callbacks.
#[derive(Debug, Default)]
pub struct RecordBundle<'a> {
    pub value: ValueIo<'a>,
    /// Stored value length, set by fetch.
    pub value_len: u64,
    /// Checksum to store (update) or the stored checksum (fetch).
    pub csum: Option<Checksum>,
    /// Pre-allocated record cell to install verbatim instead of allocating.
    pub precell: ArenaHandle,
    /// Root slot of the record's embedded subtree, when the class has one.
    pub subtree_root: ArenaHandle,
}

impl RecordBundle<'_> {
    pub fn for_update(value: &[u8], csum: Option<Checksum>) -> RecordBundle<'_> {
        RecordBundle {
            value: ValueIo::Slice(value),
            csum,
            ..Default::default()
        }
    }
}

/// Capability set of a tree class.
///
/// Every callback returns a status; the tree core aborts the surrounding
/// operation on the first error and surfaces it unchanged.
pub trait TreeOps: Send + Sync {
    /// Derive the hashed key for a logical key.
    fn hkey_gen(&self, key: &KeyBundle<'_>) -> Result<HKey, BtreeError>;

    /// Order two hashed keys. Primary ordering of the tree.
    fn hkey_cmp(&self, rec_hkey: &HKey, hkey: &HKey) -> Ordering;

    /// Tie-breaker on the full key for classes whose hashed keys can
    /// collide. `None` means the hashed key is authoritative.
    fn key_cmp(
        &self,
        _arena: &Arena,
        _rec: ArenaHandle,
        _key: &KeyBundle<'_>,
    ) -> Result<Option<Ordering>, BtreeError> {
        Ok(None)
    }

    /// Allocate and populate the record cell for a new record, or install
    /// `val.precell` verbatim when the caller pre-built the cell.
    fn rec_alloc(
        &self,
        arena: &Arena,
        key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<ArenaHandle, BtreeError>;

    /// Release a record's payload, including any owned subtree.
    fn rec_free(&self, arena: &Arena, rec: ArenaHandle) -> Result<(), BtreeError>;

    /// Read key and value out of a record.
    fn rec_fetch(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        hkey: &HKey,
        key_out: Option<&mut KeyOut>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError>;

    /// Update a record in place; classes that forbid overwrites return
    /// `NoPermission`.
    fn rec_update(
        &self,
        arena: &Arena,
        rec: ArenaHandle,
        key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError>;
}

#[derive(Clone)]
struct RegisteredClass {
    name: &'static str,
    ops: Arc<dyn TreeOps>,
}

lazy_static! {
    static ref CLASS_REGISTRY: Mutex<HashMap<u32, RegisteredClass>> = Mutex::new(HashMap::new());
}

fn registry_lock() -> std::sync::MutexGuard<'static, HashMap<u32, RegisteredClass>> {
    match CLASS_REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Register a tree class. Registration is process-wide and idempotent per
/// class id: registering an already-known id is a no-op.
pub fn register_class(
    class: u32,
    name: &'static str,
    ops: Arc<dyn TreeOps>,
) -> Result<(), BtreeError> {
    if class == 0 {
        return Err(BtreeError::InvalidArgument(
            "class id 0 is reserved for unused roots".to_string(),
        ));
    }
    let mut registry = registry_lock();
    if registry.contains_key(&class) {
        return Ok(());
    }
    registry.insert(class, RegisteredClass { name, ops });
    debug!(class, name, "registered tree class");
    Ok(())
}

fn lookup_class(class: u32) -> Result<RegisteredClass, BtreeError> {
    registry_lock()
        .get(&class)
        .cloned()
        .ok_or(BtreeError::UnknownClass(class))
}

#[derive(Debug, Clone, Copy)]
struct RootDesc {
    class: u32,
    order: u16,
    depth: u16,
    feats: u64,
    node: ArenaHandle,
}

fn read_root(arena: &Arena, slot: ArenaHandle) -> Result<RootDesc, BtreeError> {
    Ok(RootDesc {
        class: arena.read_u32(slot, ROOT_OFF_CLASS)?,
        order: arena.read_u16(slot, ROOT_OFF_ORDER)?,
        depth: arena.read_u16(slot, ROOT_OFF_DEPTH)?,
        feats: arena.read_u64(slot, ROOT_OFF_FEATS)?,
        node: ArenaHandle(arena.read_u64(slot, ROOT_OFF_NODE)?),
    })
}

fn write_root(arena: &Arena, slot: ArenaHandle, desc: &RootDesc) -> Result<(), BtreeError> {
    arena.write_u32(slot, ROOT_OFF_CLASS, desc.class)?;
    arena.write_u16(slot, ROOT_OFF_ORDER, desc.order)?;
    arena.write_u16(slot, ROOT_OFF_DEPTH, desc.depth)?;
    arena.write_u64(slot, ROOT_OFF_FEATS, desc.feats)?;
    arena.write_u64(slot, ROOT_OFF_NODE, desc.node.0)?;
    Ok(())
}

/// An open tree. Dropping it leaves persistent state untouched; `destroy`
/// reclaims it.
pub struct Btree {
    arena: Arena,
    root_slot: ArenaHandle,
    ops: Arc<dyn TreeOps>,
    class: u32,
    order: u16,
}

enum SearchStep {
    Found(u16),
    Descend(u16),
    Miss(u16),
}

impl Btree {
    /// Create a new empty tree with its root written into `root_slot`
    /// (a `TREE_ROOT_SIZE`-byte slot inside a parent cell). The slot must
    /// currently be unused (all zero).
    pub fn create_inplace(
        class: u32,
        feats: u64,
        order: u16,
        arena: &Arena,
        root_slot: ArenaHandle,
    ) -> Result<Btree, BtreeError> {
        if order < 3 {
            return Err(BtreeError::InvalidArgument(format!(
                "tree order {order} below minimum of 3"
            )));
        }
        let registered = lookup_class(class)?;
        let existing = read_root(arena, root_slot)?;
        if existing.class != 0 {
            return Err(BtreeError::InvalidArgument(format!(
                "root slot already holds a class-{} tree",
                existing.class
            )));
        }

        let desc = RootDesc {
            class,
            order,
            depth: 0,
            feats,
            node: ArenaHandle::NULL,
        };
        write_root(arena, root_slot, &desc)?;
        debug!(class, name = registered.name, order, "created tree");

        Ok(Btree {
            arena: arena.clone(),
            root_slot,
            ops: registered.ops,
            class,
            order,
        })
    }

    /// Open the tree whose root lives in `root_slot`. The slot must hold a
    /// formed tree of a registered class.
    pub fn open_inplace(arena: &Arena, root_slot: ArenaHandle) -> Result<Btree, BtreeError> {
        let desc = read_root(arena, root_slot)?;
        if desc.class == 0 {
            return Err(BtreeError::NotFound);
        }
        let registered = lookup_class(desc.class)?;

        Ok(Btree {
            arena: arena.clone(),
            root_slot,
            ops: registered.ops,
            class: desc.class,
            order: desc.order,
        })
    }

    pub fn class(&self) -> u32 {
        self.class
    }

    pub fn root_slot(&self) -> ArenaHandle {
        self.root_slot
    }

    /// Close the open handle. Persistent state is untouched.
    pub fn close(self) {}

    fn node(&self, handle: ArenaHandle) -> NodeView<'_> {
        NodeView::new(&self.arena, handle, self.order)
    }

    /// Compare slot `i` of `node` against the target key: hashed key first,
    /// full key as tie-breaker when the class has one.
    fn cmp_slot(
        &self,
        node: &NodeView<'_>,
        i: u16,
        hkey: &HKey,
        key: Option<&KeyBundle<'_>>,
    ) -> Result<Ordering, BtreeError> {
        let slot_hkey = node.hkey(i)?;
        let mut ord = self.ops.hkey_cmp(&slot_hkey, hkey);
        if ord == Ordering::Equal {
            if let Some(key) = key {
                if let Some(refined) = self.ops.key_cmp(&self.arena, node.rec(i)?, key)? {
                    ord = refined;
                }
            }
        }
        Ok(ord)
    }

    /// Locate `hkey` within one node: the matching slot, the child to
    /// descend into, or the leaf insert position.
    fn search_node(
        &self,
        node: &NodeView<'_>,
        hkey: &HKey,
        key: Option<&KeyBundle<'_>>,
    ) -> Result<SearchStep, BtreeError> {
        let count = node.count()?;
        let leaf = node.is_leaf()?;
        for i in 0..count {
            match self.cmp_slot(node, i, hkey, key)? {
                Ordering::Less => continue,
                Ordering::Equal => return Ok(SearchStep::Found(i)),
                Ordering::Greater => {
                    return Ok(if leaf {
                        SearchStep::Miss(i)
                    } else {
                        SearchStep::Descend(i)
                    });
                }
            }
        }
        Ok(if leaf {
            SearchStep::Miss(count)
        } else {
            SearchStep::Descend(count)
        })
    }

    /// Split the full child at `parent` position `i`, promoting the child's
    /// median record into `parent`. `parent` must not be full.
    fn split_child(&self, parent: &NodeView<'_>, i: u16) -> Result<(), BtreeError> {
        let child = self.node(parent.child(i)?);
        let leaf = child.is_leaf()?;
        let median = self.order / 2;
        let right_count = self.order - median - 1;

        let right = NodeView::alloc(&self.arena, self.order, leaf)?;
        for j in 0..right_count {
            right.copy_slot_from(j, &child, median + 1 + j)?;
        }
        if !leaf {
            for j in 0..=right_count {
                right.set_child(j, child.child(median + 1 + j)?)?;
            }
        }
        right.set_count(right_count)?;
        child.set_count(median)?;

        parent.shift_right_from(i)?;
        let sep_hkey = child.hkey(median)?;
        let sep_rec = child.rec(median)?;
        parent.set_slot(i, &sep_hkey, sep_rec)?;
        parent.set_child(i + 1, right.handle)?;
        parent.set_count(parent.count()? + 1)?;
        Ok(())
    }

    /// Make sure a root node exists and is not full, growing the tree by
    /// one level when needed. Returns the node to start descending from.
    fn prepare_root(&self) -> Result<ArenaHandle, BtreeError> {
        let mut desc = read_root(&self.arena, self.root_slot)?;

        if desc.node.is_null() {
            let root = NodeView::alloc(&self.arena, self.order, true)?;
            desc.node = root.handle;
            desc.depth = 1;
            write_root(&self.arena, self.root_slot, &desc)?;
            return Ok(desc.node);
        }

        let root = self.node(desc.node);
        if root.count()? == self.order {
            let new_root = NodeView::alloc(&self.arena, self.order, false)?;
            new_root.set_child(0, root.handle)?;
            self.split_child(&new_root, 0)?;
            desc.node = new_root.handle;
            desc.depth += 1;
            write_root(&self.arena, self.root_slot, &desc)?;
            return Ok(desc.node);
        }
        Ok(desc.node)
    }

    fn upsert_impl(
        &self,
        key: &KeyBundle<'_>,
        val: &mut RecordBundle<'_>,
        allow_update: bool,
    ) -> Result<(), BtreeError> {
        let hkey = self.ops.hkey_gen(key)?;
        let mut handle = self.prepare_root()?;

        loop {
            let node = self.node(handle);
            match self.search_node(&node, &hkey, Some(key))? {
                SearchStep::Found(i) => {
                    if !allow_update {
                        return Err(BtreeError::NoPermission(
                            "record already exists".to_string(),
                        ));
                    }
                    return self.ops.rec_update(&self.arena, node.rec(i)?, key, val);
                }
                SearchStep::Miss(i) => {
                    let rec = self.ops.rec_alloc(&self.arena, key, val)?;
                    if let Err(err) = self.insert_into_leaf(&node, i, &hkey, rec) {
                        // Unwind the cell the class just allocated.
                        if let Err(free_err) = self.ops.rec_free(&self.arena, rec) {
                            error!(%free_err, "failed to unwind record after insert error");
                        }
                        return Err(err);
                    }
                    return Ok(());
                }
                SearchStep::Descend(i) => {
                    let child = node.child(i)?;
                    if self.node(child).count()? == self.order {
                        self.split_child(&node, i)?;
                        // The promoted separator now sits at slot i.
                        match self.cmp_slot(&node, i, &hkey, Some(key))? {
                            Ordering::Equal => {
                                if !allow_update {
                                    return Err(BtreeError::NoPermission(
                                        "record already exists".to_string(),
                                    ));
                                }
                                return self
                                    .ops
                                    .rec_update(&self.arena, node.rec(i)?, key, val);
                            }
                            Ordering::Less => handle = node.child(i + 1)?,
                            Ordering::Greater => handle = node.child(i)?,
                        }
                    } else {
                        handle = child;
                    }
                }
            }
        }
    }

    fn insert_into_leaf(
        &self,
        node: &NodeView<'_>,
        i: u16,
        hkey: &HKey,
        rec: ArenaHandle,
    ) -> Result<(), BtreeError> {
        node.shift_right_from(i)?;
        node.set_slot(i, hkey, rec)?;
        node.set_count(node.count()? + 1)
    }

    /// Insert or update: existing records go through the class's
    /// `rec_update`, new ones through `rec_alloc`.
    pub fn upsert(&self, key: &KeyBundle<'_>, val: &mut RecordBundle<'_>) -> Result<(), BtreeError> {
        self.upsert_impl(key, val, true)
    }

    /// Insert a new record; an existing record is `NoPermission`.
    pub fn insert(&self, key: &KeyBundle<'_>, val: &mut RecordBundle<'_>) -> Result<(), BtreeError> {
        self.upsert_impl(key, val, false)
    }

    /// Find a record and fetch it through the class's `rec_fetch`.
    pub fn lookup(&self, key: &KeyBundle<'_>, val: &mut RecordBundle<'_>) -> Result<(), BtreeError> {
        let hkey = self.ops.hkey_gen(key)?;
        let rec = self.find_rec(&hkey, key)?;
        self.ops.rec_fetch(&self.arena, rec, &hkey, None, val)
    }

    fn find_rec(&self, hkey: &HKey, key: &KeyBundle<'_>) -> Result<ArenaHandle, BtreeError> {
        let desc = read_root(&self.arena, self.root_slot)?;
        let mut handle = desc.node;
        while !handle.is_null() {
            let node = self.node(handle);
            match self.search_node(&node, hkey, Some(key))? {
                SearchStep::Found(i) => return node.rec(i),
                SearchStep::Miss(_) => return Err(BtreeError::NotFound),
                SearchStep::Descend(i) => handle = node.child(i)?,
            }
        }
        Err(BtreeError::NotFound)
    }

    /// Visit every record in hashed-key order. The visitor returns `false`
    /// to stop early; `fetch_record` turns a visited handle into key/value
    /// data.
    pub fn iterate<F>(&self, visit: &mut F) -> Result<(), BtreeError>
    where
        F: FnMut(&HKey, ArenaHandle) -> Result<bool, BtreeError>,
    {
        let desc = read_root(&self.arena, self.root_slot)?;
        if desc.node.is_null() {
            return Ok(());
        }
        self.iterate_node(desc.node, visit).map(|_| ())
    }

    fn iterate_node<F>(&self, handle: ArenaHandle, visit: &mut F) -> Result<bool, BtreeError>
    where
        F: FnMut(&HKey, ArenaHandle) -> Result<bool, BtreeError>,
    {
        let node = self.node(handle);
        let count = node.count()?;
        let leaf = node.is_leaf()?;
        for i in 0..count {
            if !leaf && !self.iterate_node(node.child(i)?, visit)? {
                return Ok(false);
            }
            let hkey = node.hkey(i)?;
            if !visit(&hkey, node.rec(i)?)? {
                return Ok(false);
            }
        }
        if !leaf {
            return self.iterate_node(node.child(count)?, visit);
        }
        Ok(true)
    }

    /// Fetch a record previously yielded by `iterate`.
    pub fn fetch_record(
        &self,
        hkey: &HKey,
        rec: ArenaHandle,
        key_out: Option<&mut KeyOut>,
        val: &mut RecordBundle<'_>,
    ) -> Result<(), BtreeError> {
        self.ops.rec_fetch(&self.arena, rec, hkey, key_out, val)
    }

    /// Whether the tree holds no records.
    pub fn is_empty(&self) -> Result<bool, BtreeError> {
        let mut any = false;
        self.iterate(&mut |_, _| {
            any = true;
            Ok(false)
        })?;
        Ok(!any)
    }

    pub fn record_count(&self) -> Result<u64, BtreeError> {
        let mut n = 0u64;
        self.iterate(&mut |_, _| {
            n += 1;
            Ok(true)
        })?;
        Ok(n)
    }

    /// Remove one record: its cell is released through the class's
    /// `rec_free` and the node structure rebuilt around the survivors.
    /// Deletion is a registry-tree operation (containers leaving a pool);
    /// data trees are reclaimed wholesale via `destroy`.
    pub fn delete(&self, key: &KeyBundle<'_>) -> Result<(), BtreeError> {
        let hkey = self.ops.hkey_gen(key)?;
        let target = self.find_rec(&hkey, key)?;

        let mut survivors: Vec<(HKey, ArenaHandle)> = Vec::new();
        self.iterate(&mut |h, rec| {
            if rec != target {
                survivors.push((*h, rec));
            }
            Ok(true)
        })?;

        self.ops.rec_free(&self.arena, target)?;

        let mut desc = read_root(&self.arena, self.root_slot)?;
        if !desc.node.is_null() {
            self.free_nodes(desc.node)?;
        }
        desc.node = ArenaHandle::NULL;
        desc.depth = 0;
        write_root(&self.arena, self.root_slot, &desc)?;

        for (h, rec) in survivors {
            self.insert_raw(&h, rec)?;
        }
        Ok(())
    }

    /// Re-attach an existing record cell under its hashed key. Only used
    /// while rebuilding after a delete, where survivors arrive in order.
    fn insert_raw(&self, hkey: &HKey, rec: ArenaHandle) -> Result<(), BtreeError> {
        let mut handle = self.prepare_root()?;
        loop {
            let node = self.node(handle);
            match self.search_node(&node, hkey, None)? {
                // Equal hashed keys stay in arrival order: descend right.
                SearchStep::Found(i) => {
                    let mut i = i;
                    let count = node.count()?;
                    while i < count && self.cmp_slot(&node, i, hkey, None)? == Ordering::Equal {
                        i += 1;
                    }
                    if node.is_leaf()? {
                        return self.insert_into_leaf(&node, i, hkey, rec);
                    }
                    handle = node.child(i)?;
                    if self.node(handle).count()? == self.order {
                        self.split_child(&node, i)?;
                        handle = match self.cmp_slot(&node, i, hkey, None)? {
                            Ordering::Less | Ordering::Equal => node.child(i + 1)?,
                            Ordering::Greater => node.child(i)?,
                        };
                    }
                }
                SearchStep::Miss(i) => {
                    return self.insert_into_leaf(&node, i, hkey, rec);
                }
                SearchStep::Descend(i) => {
                    let child = node.child(i)?;
                    if self.node(child).count()? == self.order {
                        self.split_child(&node, i)?;
                        handle = match self.cmp_slot(&node, i, hkey, None)? {
                            Ordering::Less | Ordering::Equal => node.child(i + 1)?,
                            Ordering::Greater => node.child(i)?,
                        };
                    } else {
                        handle = child;
                    }
                }
            }
        }
    }

    /// Free node cells only; records must already be released.
    fn free_nodes(&self, handle: ArenaHandle) -> Result<(), BtreeError> {
        let node = self.node(handle);
        if !node.is_leaf()? {
            let count = node.count()?;
            for i in 0..=count {
                self.free_nodes(node.child(i)?)?;
            }
        }
        self.arena.free(handle)?;
        Ok(())
    }

    /// Destroy the tree: every record is released through the class's
    /// `rec_free` (cascading into embedded subtrees), node cells are freed
    /// and the root slot zeroed.
    pub fn destroy(self) -> Result<(), BtreeError> {
        let desc = read_root(&self.arena, self.root_slot)?;
        if !desc.node.is_null() {
            self.destroy_node(desc.node)?;
        }
        self.arena
            .write_bytes(self.root_slot, 0, &[0u8; TREE_ROOT_SIZE as usize])?;
        Ok(())
    }

    fn destroy_node(&self, handle: ArenaHandle) -> Result<(), BtreeError> {
        let node = self.node(handle);
        let count = node.count()?;
        let leaf = node.is_leaf()?;
        for i in 0..count {
            self.ops.rec_free(&self.arena, node.rec(i)?)?;
        }
        if !leaf {
            for i in 0..=count {
                self.destroy_node(node.child(i)?)?;
            }
        }
        self.arena.free(handle)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
