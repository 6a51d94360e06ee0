//! Process lifecycle and per-execution-context state.
//!
//! `init`/`fini` manage the process-wide singletons (tree-class registry,
//! environment-selected memory class and checksum family) behind a mutex
//! with an idempotent init flag. Everything else lives in a `VosContext`
//! that callers thread explicitly through the engine: the object cache and
//! the pool/container handle maps are context-local and unlocked, so a
//! context must not be shared between execution contexts without external
//! coordination.

use std::path::PathBuf;

use lazy_static::lazy_static;
use rustc_hash::FxHashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use verso_arena::{Arena, MemClass};
use verso_checksum::{ChecksumKind, Checksummer};

use crate::cache::{OBJ_CACHE_BITS, ObjectCache};
use crate::container::Container;
use crate::error::StorageError;
use crate::pool::Pool;
use crate::tree::register_tree_classes;

/// Environment variable selecting a volatile arena for benchmarking.
pub const ENV_MEM_CLASS: &str = "VOS_MEM_CLASS";
/// Environment variable naming the checksum family; unrecognized tags
/// disable checksumming.
pub const ENV_CHECKSUM: &str = "VOS_CHECKSUM";

/// Opaque handle naming an open pool within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub(crate) u64);

/// Opaque handle naming an open container within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy)]
struct EngineConfig {
    mem_class: MemClass,
    checksum: Option<ChecksumKind>,
}

struct EngineState {
    initialized: bool,
    config: EngineConfig,
}

lazy_static! {
    static ref ENGINE: Mutex<EngineState> = Mutex::new(EngineState {
        initialized: false,
        config: EngineConfig {
            mem_class: MemClass::Pmem,
            checksum: None,
        },
    });
}

fn engine_lock() -> MutexGuard<'static, EngineState> {
    match ENGINE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Initialize the engine once per process. Safe to call repeatedly: a
/// second call after success is a no-op returning success.
pub fn init() -> Result<(), StorageError> {
    let mut engine = engine_lock();
    if engine.initialized {
        return Ok(());
    }

    let mut config = EngineConfig {
        mem_class: MemClass::Pmem,
        checksum: None,
    };

    if let Ok(value) = std::env::var(ENV_MEM_CLASS) {
        if value.eq_ignore_ascii_case("dram") {
            warn!("running on volatile memory, nothing survives restart");
            config.mem_class = MemClass::Vmem;
        }
    }

    if let Ok(tag) = std::env::var(ENV_CHECKSUM) {
        match ChecksumKind::from_tag(&tag) {
            Some(kind) => {
                debug!(family = kind.tag(), "checksum family selected");
                config.checksum = Some(kind);
            }
            None => debug!(%tag, "unrecognized checksum family, checksums disabled"),
        }
    }

    register_tree_classes()?;

    engine.config = config;
    engine.initialized = true;
    info!("storage engine initialized");
    Ok(())
}

/// Tear down process-wide state. Contexts created before `fini` stay
/// usable until dropped; a later `init` starts the engine afresh.
pub fn fini() {
    let mut engine = engine_lock();
    if engine.initialized {
        engine.initialized = false;
        info!("storage engine finalized");
    }
}

fn engine_config() -> Result<EngineConfig, StorageError> {
    let engine = engine_lock();
    if !engine.initialized {
        return Err(StorageError::InvalidArgument(
            "storage engine not initialized".to_string(),
        ));
    }
    Ok(engine.config)
}

/// Per-execution-context engine state. All engine operations hang off a
/// context; "current context" is whatever the caller threads through, not
/// a hidden global.
pub struct VosContext {
    pub(crate) ocache: ObjectCache,
    pub(crate) pools: FxHashMap<u64, Pool>,
    pub(crate) conts: FxHashMap<u64, Container>,
    /// Volatile-mode pools, kept by path so open can find them again
    /// within this context.
    pub(crate) volatile_pools: FxHashMap<PathBuf, Arena>,
    pub(crate) checksummer: Option<Checksummer>,
    pub(crate) mem_class: MemClass,
    next_cookie: u64,
}

impl VosContext {
    /// Build a context from the process-wide configuration. `init` must
    /// have succeeded first.
    pub fn new() -> Result<VosContext, StorageError> {
        let config = engine_config()?;
        Ok(VosContext {
            ocache: ObjectCache::new(OBJ_CACHE_BITS),
            pools: FxHashMap::default(),
            conts: FxHashMap::default(),
            volatile_pools: FxHashMap::default(),
            checksummer: config.checksum.map(Checksummer::new),
            mem_class: config.mem_class,
            next_cookie: 1,
        })
    }

    pub fn mem_class(&self) -> MemClass {
        self.mem_class
    }

    /// Whether a checksum family is active for this context.
    pub fn checksum_kind(&self) -> Option<ChecksumKind> {
        self.checksummer.as_ref().map(|cs| cs.kind())
    }

    pub(crate) fn cookie(&mut self) -> u64 {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        cookie
    }

    pub(crate) fn pool(&self, poh: PoolHandle) -> Result<&Pool, StorageError> {
        self.pools
            .get(&poh.0)
            .ok_or_else(|| StorageError::NotFound(format!("unknown pool handle {:?}", poh)))
    }

    pub(crate) fn cont(&self, coh: ContainerHandle) -> Result<&Container, StorageError> {
        self.conts
            .get(&coh.0)
            .ok_or_else(|| StorageError::NotFound(format!("unknown container handle {:?}", coh)))
    }
}
