//! On-medium node layout.
//!
//! A node is one arena cell:
//!
//! ```text
//! 0        count      u16     records in use
//! 2        leaf       u16     1 = leaf node
//! 4        (reserved) u32
//! 8        slots      order * 24   [16-byte hashed key ‖ u64 record handle]
//! 8+24*o   children   (order + 1) * u64   internal nodes only
//! ```

use verso_arena::{Arena, ArenaHandle};

use crate::{BtreeError, HKey, HKEY_SIZE};

const OFF_COUNT: u64 = 0;
const OFF_LEAF: u64 = 2;
const OFF_SLOTS: u64 = 8;

const SLOT_SIZE: u64 = HKEY_SIZE as u64 + 8;

pub(crate) fn node_size(order: u16) -> u64 {
    OFF_SLOTS + u64::from(order) * SLOT_SIZE + (u64::from(order) + 1) * 8
}

fn children_base(order: u16) -> u64 {
    OFF_SLOTS + u64::from(order) * SLOT_SIZE
}

/// Accessor for one node cell. Cheap to construct; all state lives in the
/// arena.
#[derive(Clone, Copy)]
pub(crate) struct NodeView<'a> {
    arena: &'a Arena,
    pub(crate) handle: ArenaHandle,
    order: u16,
}

impl<'a> NodeView<'a> {
    pub(crate) fn new(arena: &'a Arena, handle: ArenaHandle, order: u16) -> Self {
        Self {
            arena,
            handle,
            order,
        }
    }

    pub(crate) fn alloc(arena: &'a Arena, order: u16, leaf: bool) -> Result<Self, BtreeError> {
        let handle = arena.alloc(node_size(order))?;
        let node = Self::new(arena, handle, order);
        node.set_leaf(leaf)?;
        Ok(node)
    }

    pub(crate) fn count(&self) -> Result<u16, BtreeError> {
        Ok(self.arena.read_u16(self.handle, OFF_COUNT)?)
    }

    pub(crate) fn set_count(&self, count: u16) -> Result<(), BtreeError> {
        Ok(self.arena.write_u16(self.handle, OFF_COUNT, count)?)
    }

    pub(crate) fn is_leaf(&self) -> Result<bool, BtreeError> {
        Ok(self.arena.read_u16(self.handle, OFF_LEAF)? != 0)
    }

    fn set_leaf(&self, leaf: bool) -> Result<(), BtreeError> {
        Ok(self.arena.write_u16(self.handle, OFF_LEAF, u16::from(leaf))?)
    }

    fn slot_off(&self, i: u16) -> u64 {
        OFF_SLOTS + u64::from(i) * SLOT_SIZE
    }

    pub(crate) fn hkey(&self, i: u16) -> Result<HKey, BtreeError> {
        let mut bytes = [0u8; HKEY_SIZE];
        self.arena.read_into(self.handle, self.slot_off(i), &mut bytes)?;
        Ok(HKey(bytes))
    }

    pub(crate) fn rec(&self, i: u16) -> Result<ArenaHandle, BtreeError> {
        Ok(ArenaHandle(self.arena.read_u64(
            self.handle,
            self.slot_off(i) + HKEY_SIZE as u64,
        )?))
    }

    pub(crate) fn set_slot(&self, i: u16, hkey: &HKey, rec: ArenaHandle) -> Result<(), BtreeError> {
        self.arena.write_bytes(self.handle, self.slot_off(i), &hkey.0)?;
        self.arena
            .write_u64(self.handle, self.slot_off(i) + HKEY_SIZE as u64, rec.0)?;
        Ok(())
    }

    pub(crate) fn child(&self, i: u16) -> Result<ArenaHandle, BtreeError> {
        Ok(ArenaHandle(self.arena.read_u64(
            self.handle,
            children_base(self.order) + u64::from(i) * 8,
        )?))
    }

    pub(crate) fn set_child(&self, i: u16, child: ArenaHandle) -> Result<(), BtreeError> {
        Ok(self.arena.write_u64(
            self.handle,
            children_base(self.order) + u64::from(i) * 8,
            child.0,
        )?)
    }

    /// Copy slot `from` of `src` into slot `to` of `self`.
    pub(crate) fn copy_slot_from(&self, to: u16, src: &NodeView<'_>, from: u16) -> Result<(), BtreeError> {
        let hkey = src.hkey(from)?;
        let rec = src.rec(from)?;
        self.set_slot(to, &hkey, rec)
    }

    /// Open a hole at slot `i`, shifting slots (and, for internal nodes,
    /// the child pointers right of the hole) one position to the right.
    pub(crate) fn shift_right_from(&self, i: u16) -> Result<(), BtreeError> {
        let count = self.count()?;
        let mut j = count;
        while j > i {
            self.copy_slot_from(j, self, j - 1)?;
            j -= 1;
        }
        if !self.is_leaf()? {
            let mut j = count + 1;
            while j > i + 1 {
                self.set_child(j, self.child(j - 1)?)?;
                j -= 1;
            }
        }
        Ok(())
    }
}
