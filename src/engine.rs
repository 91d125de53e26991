//! The RP engine: shared state bundle for lifecycle, ingestion, and alias
//! operations. Lifecycle methods live in `room::lifecycle`, ingestion in
//! `room::ingest`.

use crate::alias::AliasResolver;
use crate::config::Config;
use crate::lock::RuntimeLock;
use crate::room::RoomStore;

use std::sync::Arc;

/// Single-writer engine over the file-backed room state.
///
/// Correctness relies on one process being the sole writer (enforced by the
/// runtime lock) and on callers serializing same-room events.
#[derive(Clone)]
pub struct RpEngine {
    store: RoomStore,
    alias: AliasResolver,
    lock: RuntimeLock,
    config: Arc<Config>,
}

impl RpEngine {
    pub fn new(config: Arc<Config>) -> Self {
        let store = RoomStore::new(config.rooms_dir());
        let alias = AliasResolver::new(store.clone(), config.protected_pref_keys());
        let lock = RuntimeLock::new(store.clone());
        Self {
            store,
            alias,
            lock,
            config,
        }
    }

    /// Engine with an explicit store root (tests).
    pub fn with_store(store: RoomStore, config: Arc<Config>) -> Self {
        let alias = AliasResolver::new(store.clone(), config.protected_pref_keys());
        let lock = RuntimeLock::new(store.clone());
        Self {
            store,
            alias,
            lock,
            config,
        }
    }

    pub fn store(&self) -> &RoomStore {
        &self.store
    }

    pub fn alias(&self) -> &AliasResolver {
        &self.alias
    }

    pub fn lock(&self) -> &RuntimeLock {
        &self.lock
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
