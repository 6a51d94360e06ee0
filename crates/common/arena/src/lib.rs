//! Allocator facade over a single storage arena.
//!
//! All persistent state of a pool lives inside one arena: a flat byte space
//! addressed by stable, base-relative handles. Cells are length-prefixed
//! variable-size allocations; every mutation of arena memory goes through
//! this facade so write-back ordering stays in one place.
//!
//! Two backends share the same layout: `Pmem` is backed by a pool file and
//! survives restart once `persist` has run; `Vmem` is anonymous heap memory
//! for benchmarking, nothing is durable.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use std::collections::HashMap;

use tracing::{debug, info};

const ARENA_MAGIC: u64 = 0x3172_416f_7372_6576;
const ARENA_VERSION: u32 = 1;

const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_CAPACITY: u64 = 16;
const OFF_CURSOR: u64 = 24;
const OFF_LIVE: u64 = 32;

/// Fixed region inside the superblock owned by the arena's opener; the
/// pool layer keeps its container-table root here.
const ROOT_SLOT_OFF: u64 = 64;
pub const ROOT_SLOT_LEN: u64 = 64;

/// First byte after the superblock; cells start here.
const FIRST_CELL_OFF: u64 = 128;

const CELL_ALIGN: u64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    NoMemory { requested: u64, available: u64 },

    #[error("invalid arena handle {0:#x}")]
    InvalidHandle(u64),

    #[error("out-of-bounds arena access at {offset:#x}, len {len}")]
    OutOfBounds { offset: u64, len: u64 },

    #[error("not an arena file: {0}")]
    BadFormat(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Base-relative address of a cell's payload. Handles stay valid across
/// close/reopen of the arena; a zero handle is the null handle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaHandle(pub u64);

impl ArenaHandle {
    pub const NULL: ArenaHandle = ArenaHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Memory class the arena runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemClass {
    /// File-backed; durable after `persist`.
    Pmem,
    /// Volatile heap; nothing survives close.
    Vmem,
}

/// Arena attributes reported to callers.
#[derive(Debug, Clone, Copy)]
pub struct ArenaAttrs {
    pub mem_class: MemClass,
    pub capacity: u64,
    pub live_bytes: u64,
}

struct ArenaInner {
    mem: Vec<u8>,
    backing: Option<File>,
    path: Option<PathBuf>,
    /// Freed cells indexed by payload size, reused on exact-size alloc.
    /// Session-local: the persistent live-byte counter is authoritative.
    free: HashMap<u64, Vec<u64>>,
}

impl ArenaInner {
    fn read_u64_at(&self, off: u64) -> Result<u64, ArenaError> {
        let bytes = self.slice(off, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64_at(&mut self, off: u64, v: u64) -> Result<(), ArenaError> {
        self.slice_mut(off, 8)?.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    fn slice(&self, off: u64, len: u64) -> Result<&[u8], ArenaError> {
        let end = off
            .checked_add(len)
            .ok_or(ArenaError::OutOfBounds { offset: off, len })?;
        if end > self.mem.len() as u64 {
            return Err(ArenaError::OutOfBounds { offset: off, len });
        }
        Ok(&self.mem[off as usize..end as usize])
    }

    fn slice_mut(&mut self, off: u64, len: u64) -> Result<&mut [u8], ArenaError> {
        let end = off
            .checked_add(len)
            .ok_or(ArenaError::OutOfBounds { offset: off, len })?;
        if end > self.mem.len() as u64 {
            return Err(ArenaError::OutOfBounds { offset: off, len });
        }
        Ok(&mut self.mem[off as usize..end as usize])
    }

    fn capacity(&self) -> u64 {
        // Superblock fields are always mapped.
        self.read_u64_at(OFF_CAPACITY).unwrap_or(0)
    }

    fn cursor(&self) -> u64 {
        self.read_u64_at(OFF_CURSOR).unwrap_or(FIRST_CELL_OFF)
    }

    fn live_bytes(&self) -> u64 {
        self.read_u64_at(OFF_LIVE).unwrap_or(0)
    }

    /// Validate that `handle` plausibly names a cell payload and return the
    /// payload length stored in its prefix.
    fn cell_len(&self, handle: ArenaHandle) -> Result<u64, ArenaError> {
        if handle.0 < FIRST_CELL_OFF + 8 || handle.0 >= self.cursor() {
            return Err(ArenaError::InvalidHandle(handle.0));
        }
        let len = self.read_u64_at(handle.0 - 8)?;
        if handle.0 + len > self.cursor() {
            return Err(ArenaError::InvalidHandle(handle.0));
        }
        Ok(len)
    }
}

/// Shared handle to one arena. Clones see the same memory.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<Mutex<ArenaInner>>,
    mem_class: MemClass,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("mem_class", &self.mem_class)
            .finish()
    }
}

fn init_superblock(mem: &mut [u8], capacity: u64) {
    mem[OFF_MAGIC as usize..8].copy_from_slice(&ARENA_MAGIC.to_le_bytes());
    mem[OFF_VERSION as usize..12].copy_from_slice(&ARENA_VERSION.to_le_bytes());
    mem[12..16].copy_from_slice(&0u32.to_le_bytes());
    mem[OFF_CAPACITY as usize..24].copy_from_slice(&capacity.to_le_bytes());
    mem[OFF_CURSOR as usize..32].copy_from_slice(&FIRST_CELL_OFF.to_le_bytes());
    mem[OFF_LIVE as usize..40].copy_from_slice(&0u64.to_le_bytes());
}

impl Arena {
    /// Create a new file-backed arena at `path` with the given capacity.
    /// Fails if the file already exists.
    pub fn create(path: &Path, capacity: u64) -> Result<Arena, ArenaError> {
        if capacity < FIRST_CELL_OFF {
            return Err(ArenaError::BadFormat(format!(
                "capacity {capacity} smaller than arena superblock"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut mem = vec![0u8; FIRST_CELL_OFF as usize];
        init_superblock(&mut mem, capacity);

        let arena = Arena {
            inner: Arc::new(Mutex::new(ArenaInner {
                mem,
                backing: Some(file),
                path: Some(path.to_path_buf()),
                free: HashMap::new(),
            })),
            mem_class: MemClass::Pmem,
        };
        arena.persist()?;
        info!(path = %path.display(), capacity, "created arena");
        Ok(arena)
    }

    /// Open an existing file-backed arena.
    pub fn open(path: &Path) -> Result<Arena, ArenaError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut mem = Vec::new();
        file.read_to_end(&mut mem)?;

        if mem.len() < FIRST_CELL_OFF as usize {
            return Err(ArenaError::BadFormat(format!(
                "{}: truncated superblock",
                path.display()
            )));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&mem[..8]);
        if u64::from_le_bytes(magic) != ARENA_MAGIC {
            return Err(ArenaError::BadFormat(format!(
                "{}: bad magic",
                path.display()
            )));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&mem[8..12]);
        if u32::from_le_bytes(version) != ARENA_VERSION {
            return Err(ArenaError::BadFormat(format!(
                "{}: unsupported layout version {}",
                path.display(),
                u32::from_le_bytes(version)
            )));
        }

        debug!(path = %path.display(), "opened arena");
        Ok(Arena {
            inner: Arc::new(Mutex::new(ArenaInner {
                mem,
                backing: Some(file),
                path: Some(path.to_path_buf()),
                free: HashMap::new(),
            })),
            mem_class: MemClass::Pmem,
        })
    }

    /// Create a volatile arena. Same layout, no backing file.
    pub fn volatile(capacity: u64) -> Arena {
        let mut mem = vec![0u8; FIRST_CELL_OFF as usize];
        init_superblock(&mut mem, capacity);
        Arena {
            inner: Arc::new(Mutex::new(ArenaInner {
                mem,
                backing: None,
                path: None,
                free: HashMap::new(),
            })),
            mem_class: MemClass::Vmem,
        }
    }

    /// Remove the backing file of a pool arena. The arena must already be
    /// dropped by all users; this only unlinks the file.
    pub fn unlink(path: &Path) -> Result<(), ArenaError> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        // Single-context discipline makes poisoning unreachable in practice;
        // recover the guard rather than wedging the whole pool.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn mem_class(&self) -> MemClass {
        self.mem_class
    }

    pub fn attrs(&self) -> ArenaAttrs {
        let inner = self.lock();
        ArenaAttrs {
            mem_class: self.mem_class,
            capacity: inner.capacity(),
            live_bytes: inner.live_bytes(),
        }
    }

    /// Bytes currently allocated to live cells, including their length
    /// prefixes. Returns to its prior value once every allocation made
    /// after that point has been freed.
    pub fn live_bytes(&self) -> u64 {
        self.lock().live_bytes()
    }

    /// Handle to the fixed root slot inside the superblock
    /// (`ROOT_SLOT_LEN` bytes, zeroed at create).
    pub fn root_slot(&self) -> ArenaHandle {
        ArenaHandle(ROOT_SLOT_OFF)
    }

    /// Allocate a cell of `size` payload bytes, zero-filled. The cell is
    /// length-prefixed; the returned handle addresses the payload.
    pub fn alloc(&self, size: u64) -> Result<ArenaHandle, ArenaError> {
        let mut inner = self.lock();

        if size == 0 {
            return Err(ArenaError::BadFormat("zero-size allocation".to_string()));
        }

        // Exact-size reuse from the session free list.
        let reused = inner.free.get_mut(&size).and_then(|cells| cells.pop());
        if let Some(off) = reused {
            let total = 8 + size;
            let payload = off + 8;
            inner.slice_mut(payload, size)?.fill(0);
            let live = inner.live_bytes() + total;
            inner.write_u64_at(OFF_LIVE, live)?;
            return Ok(ArenaHandle(payload));
        }

        let cursor = inner.cursor();
        let total = 8 + size;
        let aligned_end = match cursor.checked_add(total) {
            Some(end) => end.div_ceil(CELL_ALIGN) * CELL_ALIGN,
            None => {
                return Err(ArenaError::NoMemory {
                    requested: size,
                    available: 0,
                });
            }
        };
        let capacity = inner.capacity();
        if aligned_end > capacity {
            return Err(ArenaError::NoMemory {
                requested: size,
                available: capacity.saturating_sub(cursor),
            });
        }

        if aligned_end as usize > inner.mem.len() {
            inner.mem.resize(aligned_end as usize, 0);
        }
        inner.write_u64_at(cursor, size)?;
        inner.write_u64_at(OFF_CURSOR, aligned_end)?;
        let live = inner.live_bytes() + total;
        inner.write_u64_at(OFF_LIVE, live)?;

        Ok(ArenaHandle(cursor + 8))
    }

    /// Free a cell. The handle must have come from `alloc` on this arena.
    pub fn free(&self, handle: ArenaHandle) -> Result<(), ArenaError> {
        if handle.is_null() {
            return Ok(());
        }
        let mut inner = self.lock();
        let len = inner.cell_len(handle)?;
        let total = 8 + len;
        let live = inner.live_bytes().saturating_sub(total);
        inner.write_u64_at(OFF_LIVE, live)?;
        inner.free.entry(len).or_default().push(handle.0 - 8);
        Ok(())
    }

    /// Payload length of a live cell.
    pub fn cell_len(&self, handle: ArenaHandle) -> Result<u64, ArenaError> {
        self.lock().cell_len(handle)
    }

    pub fn read_bytes(&self, handle: ArenaHandle, off: u64, len: u64) -> Result<Vec<u8>, ArenaError> {
        if handle.is_null() {
            return Err(ArenaError::InvalidHandle(0));
        }
        let inner = self.lock();
        let abs = handle
            .0
            .checked_add(off)
            .ok_or(ArenaError::OutOfBounds { offset: off, len })?;
        Ok(inner.slice(abs, len)?.to_vec())
    }

    pub fn read_into(
        &self,
        handle: ArenaHandle,
        off: u64,
        out: &mut [u8],
    ) -> Result<(), ArenaError> {
        if handle.is_null() {
            return Err(ArenaError::InvalidHandle(0));
        }
        let inner = self.lock();
        let len = out.len() as u64;
        let abs = handle
            .0
            .checked_add(off)
            .ok_or(ArenaError::OutOfBounds { offset: off, len })?;
        out.copy_from_slice(inner.slice(abs, len)?);
        Ok(())
    }

    pub fn write_bytes(&self, handle: ArenaHandle, off: u64, data: &[u8]) -> Result<(), ArenaError> {
        if handle.is_null() {
            return Err(ArenaError::InvalidHandle(0));
        }
        let mut inner = self.lock();
        let len = data.len() as u64;
        let abs = handle
            .0
            .checked_add(off)
            .ok_or(ArenaError::OutOfBounds { offset: off, len })?;
        inner.slice_mut(abs, len)?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_u64(&self, handle: ArenaHandle, off: u64) -> Result<u64, ArenaError> {
        let mut buf = [0u8; 8];
        self.read_into(handle, off, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, handle: ArenaHandle, off: u64, v: u64) -> Result<(), ArenaError> {
        self.write_bytes(handle, off, &v.to_le_bytes())
    }

    pub fn read_u32(&self, handle: ArenaHandle, off: u64) -> Result<u32, ArenaError> {
        let mut buf = [0u8; 4];
        self.read_into(handle, off, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, handle: ArenaHandle, off: u64, v: u32) -> Result<(), ArenaError> {
        self.write_bytes(handle, off, &v.to_le_bytes())
    }

    pub fn read_u16(&self, handle: ArenaHandle, off: u64) -> Result<u16, ArenaError> {
        let mut buf = [0u8; 2];
        self.read_into(handle, off, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn write_u16(&self, handle: ArenaHandle, off: u64, v: u16) -> Result<(), ArenaError> {
        self.write_bytes(handle, off, &v.to_le_bytes())
    }

    /// Write the arena back to its pool file. Durability barrier for every
    /// mutation made since the previous call. No-op on volatile arenas.
    pub fn persist(&self) -> Result<(), ArenaError> {
        let mut inner = self.lock();
        let ArenaInner {
            mem, backing: Some(file), ..
        } = &mut *inner
        else {
            return Ok(());
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(mem)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_restores_live_bytes() {
        let arena = Arena::volatile(1 << 20);
        let baseline = arena.live_bytes();

        let a = arena.alloc(100).expect("alloc");
        let b = arena.alloc(32).expect("alloc");
        assert!(arena.live_bytes() > baseline);

        arena.free(a).expect("free");
        arena.free(b).expect("free");
        assert_eq!(arena.live_bytes(), baseline);
    }

    #[test]
    fn freed_cell_is_reused_for_same_size() {
        let arena = Arena::volatile(1 << 20);
        let a = arena.alloc(64).expect("alloc");
        arena.write_u64(a, 0, 0xdead_beef).expect("write");
        arena.free(a).expect("free");

        let b = arena.alloc(64).expect("alloc");
        assert_eq!(a, b);
        // reused cells come back zeroed
        assert_eq!(arena.read_u64(b, 0).expect("read"), 0);
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let arena = Arena::volatile(256);
        let err = arena.alloc(1 << 20).expect_err("must exhaust");
        assert!(matches!(err, ArenaError::NoMemory { .. }));
    }

    #[test]
    fn out_of_cell_reads_are_rejected() {
        let arena = Arena::volatile(1 << 20);
        let h = arena.alloc(16).expect("alloc");
        assert!(arena.read_bytes(h, 0, 16).is_ok());
        assert!(arena.read_bytes(h, 1 << 21, 8).is_err());
        assert!(arena.free(ArenaHandle(3)).is_err());
    }

    #[test]
    fn persist_and_reopen_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.arena");

        let handle;
        {
            let arena = Arena::create(&path, 1 << 20).expect("create");
            handle = arena.alloc(24).expect("alloc");
            arena.write_bytes(handle, 0, b"persistent data oblige!!").expect("write");
            arena
                .write_u64(arena.root_slot(), 0, handle.0)
                .expect("root");
            arena.persist().expect("persist");
        }

        let arena = Arena::open(&path).expect("open");
        let root = arena.read_u64(arena.root_slot(), 0).expect("root");
        assert_eq!(root, handle.0);
        assert_eq!(
            arena.read_bytes(ArenaHandle(root), 0, 24).expect("read"),
            b"persistent data oblige!!"
        );
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("not-an-arena");
        std::fs::write(&path, b"short").expect("write");
        assert!(matches!(
            Arena::open(&path),
            Err(ArenaError::BadFormat(_))
        ));
    }
}
