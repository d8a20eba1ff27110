//! Persisted device state and scoped access to it.
//!
//! Everything that must survive a process restart lives in one document:
//! the bundle table, the activation pointers, the readiness watchdog record,
//! the delay directive and the device identity.
//!
//! All mutations go through [`StateStore::lock`], which hands out a
//! [`StateGuard`]. A guard that was written through is flushed to storage by
//! `commit()` or, on any other exit path, by `Drop`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, warn};

use crate::bundle::{Bundle, BundleId};
use crate::delay::DelayDirective;
use crate::error::OtaResult;
use crate::readiness::ReadinessRecord;
use crate::storage::Storage;

/// Current schema version of the state document
pub const STATE_SCHEMA: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_schema")]
    pub schema: u32,
    /// Generated once, reused for all server communication
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub bundles: BTreeMap<BundleId, Bundle>,
    #[serde(default = "BundleId::builtin")]
    pub current: BundleId,
    #[serde(default)]
    pub next: Option<BundleId>,
    /// Pre-fetched while a delay directive was active
    #[serde(default)]
    pub staged: Option<BundleId>,
    /// Bundles confirmed healthy, oldest first
    #[serde(default)]
    pub known_good: Vec<BundleId>,
    #[serde(default)]
    pub readiness: Option<ReadinessRecord>,
    #[serde(default)]
    pub delay: Option<DelayDirective>,
    #[serde(default)]
    pub last_native_version: Option<String>,
}

fn default_schema() -> u32 {
    STATE_SCHEMA
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            schema: STATE_SCHEMA,
            device_id: None,
            bundles: BTreeMap::new(),
            current: BundleId::builtin(),
            next: None,
            staged: None,
            known_good: Vec::new(),
            readiness: None,
            delay: None,
            last_native_version: None,
        }
    }
}

impl PersistedState {
    /// Look up a bundle, resolving the builtin sentinel
    pub fn bundle(&self, id: &BundleId) -> Option<Bundle> {
        if id.is_builtin() {
            return Some(Bundle::builtin());
        }
        self.bundles.get(id).cloned()
    }

    pub fn current_bundle(&self) -> Bundle {
        self.bundle(&self.current).unwrap_or_else(Bundle::builtin)
    }

    /// Drop every pointer that references `id` (except `current`)
    pub fn forget_pointers(&mut self, id: &BundleId) {
        if self.next.as_ref() == Some(id) {
            self.next = None;
        }
        if self.staged.as_ref() == Some(id) {
            self.staged = None;
        }
        self.known_good.retain(|good| good != id);
    }

    pub fn mark_known_good(&mut self, id: &BundleId) {
        if id.is_builtin() {
            return;
        }
        self.known_good.retain(|good| good != id);
        self.known_good.push(id.clone());
    }
}

/// Owner of the in-memory state and its durable copy
pub struct StateStore {
    state: Mutex<PersistedState>,
    storage: Arc<dyn Storage>,
}

impl StateStore {
    /// Load state from storage; a missing or unreadable document starts fresh
    pub fn open(storage: Arc<dyn Storage>) -> Self {
        let state = match storage.read_state() {
            Ok(Some(state)) => {
                if state.schema > STATE_SCHEMA {
                    warn!(
                        "State schema {} is newer than supported {}, reading anyway",
                        state.schema, STATE_SCHEMA
                    );
                }
                state
            }
            Ok(None) => PersistedState::default(),
            Err(e) => {
                error!("Failed to read persisted state, falling back to builtin: {}", e);
                PersistedState::default()
            }
        };

        Self {
            state: Mutex::new(state),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Scoped acquisition of the state
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            state: self.state.lock().unwrap_or_else(|e| e.into_inner()),
            storage: self.storage.as_ref(),
            dirty: false,
        }
    }

    /// Copy of the current state without taking part in a mutation
    pub fn snapshot(&self) -> PersistedState {
        self.lock().clone()
    }
}

/// Exclusive, flushing handle on the state
///
/// Holding a guard serializes all other state access. Mutable access marks
/// the guard dirty; a dirty guard is written to storage when committed or
/// dropped.
pub struct StateGuard<'a> {
    state: MutexGuard<'a, PersistedState>,
    storage: &'a dyn Storage,
    dirty: bool,
}

impl StateGuard<'_> {
    /// Flush now and report the outcome
    pub fn commit(mut self) -> OtaResult<()> {
        let result = self.flush();
        self.dirty = false;
        result
    }

    fn flush(&mut self) -> OtaResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.storage.write_state(&self.state)
    }
}

impl Deref for StateGuard<'_> {
    type Target = PersistedState;

    fn deref(&self) -> &PersistedState {
        &self.state
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut PersistedState {
        self.dirty = true;
        &mut self.state
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Failed to flush state on release: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OtaError;
    use crate::storage::FileStorage;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> (StateStore, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp.path()));
        (StateStore::open(storage.clone()), storage)
    }

    #[test]
    fn test_default_points_at_builtin() {
        let state = PersistedState::default();
        assert!(state.current.is_builtin());
        assert!(state.current_bundle().is_builtin());
        assert!(state.next.is_none());
    }

    #[test]
    fn test_commit_persists() {
        let temp = TempDir::new().unwrap();
        let (store, storage) = store(&temp);

        let mut guard = store.lock();
        guard.last_native_version = Some("1.2.3".into());
        guard.commit().unwrap();

        let on_disk = storage.read_state().unwrap().unwrap();
        assert_eq!(on_disk.last_native_version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_drop_flushes_on_error_path() {
        let temp = TempDir::new().unwrap();
        let (store, storage) = store(&temp);

        let result: OtaResult<()> = (|| {
            let mut guard = store.lock();
            guard.device_id = Some("dev-1".into());
            Err(OtaError::InvalidArgument("bail out".into()))
        })();
        assert!(result.is_err());

        let on_disk = storage.read_state().unwrap().unwrap();
        assert_eq!(on_disk.device_id.as_deref(), Some("dev-1"));
    }

    #[test]
    fn test_read_only_guard_does_not_write() {
        let temp = TempDir::new().unwrap();
        let (store, storage) = store(&temp);

        {
            let guard = store.lock();
            assert!(guard.current.is_builtin());
        }
        assert!(storage.read_state().unwrap().is_none());
    }

    #[test]
    fn test_reopen_restores_state() {
        let temp = TempDir::new().unwrap();
        {
            let (store, _) = store(&temp);
            let mut guard = store.lock();
            guard.device_id = Some("dev-2".into());
        }
        let (store, _) = store(&temp);
        assert_eq!(store.snapshot().device_id.as_deref(), Some("dev-2"));
    }

    #[test]
    fn test_forget_pointers() {
        let mut state = PersistedState::default();
        let id = BundleId::from("abc");
        state.next = Some(id.clone());
        state.staged = Some(id.clone());
        state.mark_known_good(&id);
        state.forget_pointers(&id);
        assert!(state.next.is_none());
        assert!(state.staged.is_none());
        assert!(state.known_good.is_empty());
    }
}
