//! Bundle Registry - the single source of truth for which bundles exist.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bundle::{Bundle, BundleId, BundleStatus, BUILTIN_ID};
use crate::clock::Clock;
use crate::error::{OtaError, OtaResult};
use crate::state::StateStore;
use crate::storage::Storage;

#[derive(Clone)]
pub struct BundleRegistry {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl BundleRegistry {
    pub fn new(store: Arc<StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        self.store.storage()
    }

    /// The app-store-shipped sentinel; never stored, always available
    pub fn builtin(&self) -> Bundle {
        Bundle::builtin()
    }

    /// Insert a fresh `pending` bundle and persist it immediately
    pub fn create(&self, version: &str) -> OtaResult<Bundle> {
        let version = version.trim();
        if version.is_empty() {
            return Err(OtaError::InvalidArgument("Bundle version must not be empty".into()));
        }
        if version == BUILTIN_ID {
            return Err(OtaError::InvalidArgument(format!(
                "'{}' is reserved for the builtin bundle",
                BUILTIN_ID
            )));
        }

        let mut state = self.store.lock();
        if state.bundles.values().any(|b| b.version == version) {
            return Err(OtaError::AlreadyExists(version.to_string()));
        }

        let bundle = Bundle::new(version, self.clock.now());
        state.bundles.insert(bundle.id.clone(), bundle.clone());
        state.commit()?;

        debug!("Created bundle {} for version {}", bundle.id, bundle.version);
        Ok(bundle)
    }

    pub fn get(&self, id: &BundleId) -> OtaResult<Bundle> {
        self.store
            .lock()
            .bundle(id)
            .ok_or_else(|| OtaError::NotFound(id.to_string()))
    }

    pub fn find_by_version(&self, version: &str) -> Option<Bundle> {
        self.store
            .lock()
            .bundles
            .values()
            .find(|b| b.version == version)
            .cloned()
    }

    /// Every stored bundle, ordered by download time then id
    pub fn list(&self) -> Vec<Bundle> {
        let mut bundles: Vec<Bundle> = self.store.lock().bundles.values().cloned().collect();
        bundles.sort_by(|a, b| a.downloaded.cmp(&b.downloaded).then_with(|| a.id.cmp(&b.id)));
        bundles
    }

    pub fn set_status(&self, id: &BundleId, status: BundleStatus) -> OtaResult<Bundle> {
        self.update(id, status, |bundle| bundle.status = status)
    }

    /// Mark a bundle verified, recording the archive checksum
    pub fn mark_success(&self, id: &BundleId, checksum: Option<String>) -> OtaResult<Bundle> {
        self.update(id, BundleStatus::Success, |bundle| {
            bundle.status = BundleStatus::Success;
            if checksum.is_some() {
                bundle.checksum = checksum;
            }
        })
    }

    fn update<F>(&self, id: &BundleId, to: BundleStatus, apply: F) -> OtaResult<Bundle>
    where
        F: FnOnce(&mut Bundle),
    {
        if id.is_builtin() {
            return Err(OtaError::InvalidTransition {
                id: id.to_string(),
                from: BundleStatus::Success,
                to,
            });
        }

        let now = self.clock.now();
        let mut state = self.store.lock();
        let from = state
            .bundles
            .get(id)
            .map(|b| b.status)
            .ok_or_else(|| OtaError::NotFound(id.to_string()))?;

        if !from.can_transition_to(to) {
            return Err(OtaError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        let bundle = match state.bundles.get_mut(id) {
            Some(bundle) => bundle,
            None => return Err(OtaError::NotFound(id.to_string())),
        };
        apply(bundle);
        if to == BundleStatus::Success && from != BundleStatus::Success {
            bundle.downloaded = now;
        }
        let updated = bundle.clone();
        state.commit()?;

        if from != to {
            debug!("Bundle {} status {} -> {}", id, from, to);
        }
        Ok(updated)
    }

    /// Remove a bundle and its files
    ///
    /// The entry and every pointer to it are persisted away before the files
    /// go, so a crash in between only leaves an orphan directory for the
    /// startup sweep.
    pub fn delete(&self, id: &BundleId) -> OtaResult<()> {
        if id.is_builtin() {
            return Err(OtaError::InUse("the builtin bundle can never be deleted".into()));
        }

        {
            let mut state = self.store.lock();
            if &state.current == id {
                return Err(OtaError::InUse(format!(
                    "{} is the current bundle; reset before deleting it",
                    id
                )));
            }
            if !state.bundles.contains_key(id) {
                return Err(OtaError::NotFound(id.to_string()));
            }

            if state.next.as_ref() == Some(id) {
                info!("Clearing next pointer before deleting {}", id);
            }
            state.forget_pointers(id);
            if state.readiness.as_ref().map(|r| &r.bundle_id) == Some(id) {
                state.readiness = None;
            }
            state.bundles.remove(id);
            state.commit()?;
        }

        if let Err(e) = self.storage().remove_bundle_files(id) {
            warn!("Files of deleted bundle {} left behind, will retry at startup: {}", id, e);
        }
        info!("Deleted bundle {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::FileStorage;
    use tempfile::TempDir;

    fn registry(temp: &TempDir) -> (BundleRegistry, Arc<StateStore>) {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp.path()));
        let store = Arc::new(StateStore::open(storage));
        (BundleRegistry::new(store.clone(), Arc::new(SystemClock)), store)
    }

    #[test]
    fn test_create_persists_pending() {
        let temp = TempDir::new().unwrap();
        let (registry, store) = registry(&temp);

        let bundle = registry.create("1.0.0").unwrap();
        assert_eq!(bundle.status, BundleStatus::Pending);

        let on_disk = store.storage().read_state().unwrap().unwrap();
        assert!(on_disk.bundles.contains_key(&bundle.id));
    }

    #[test]
    fn test_version_unique_and_not_reserved() {
        let temp = TempDir::new().unwrap();
        let (registry, _) = registry(&temp);

        registry.create("1.0.0").unwrap();
        assert_eq!(
            registry.create("1.0.0").unwrap_err(),
            OtaError::AlreadyExists("1.0.0".into())
        );
        assert!(registry.create("builtin").is_err());
        assert!(registry.create("  ").is_err());
    }

    #[test]
    fn test_status_transitions() {
        let temp = TempDir::new().unwrap();
        let (registry, _) = registry(&temp);
        let bundle = registry.create("1.0.0").unwrap();

        registry.set_status(&bundle.id, BundleStatus::Downloading).unwrap();
        let done = registry.mark_success(&bundle.id, Some("abc".into())).unwrap();
        assert_eq!(done.status, BundleStatus::Success);
        assert_eq!(done.checksum.as_deref(), Some("abc"));

        let err = registry.set_status(&bundle.id, BundleStatus::Pending).unwrap_err();
        assert!(matches!(err, OtaError::InvalidTransition { .. }));
        let err = registry.set_status(&bundle.id, BundleStatus::Downloading).unwrap_err();
        assert!(matches!(err, OtaError::InvalidTransition { .. }));

        registry.set_status(&bundle.id, BundleStatus::Error).unwrap();
        assert!(registry.set_status(&bundle.id, BundleStatus::Downloading).is_err());
    }

    #[test]
    fn test_unknown_id() {
        let temp = TempDir::new().unwrap();
        let (registry, _) = registry(&temp);
        let missing = BundleId::from("nope");
        assert_eq!(
            registry.set_status(&missing, BundleStatus::Error).unwrap_err(),
            OtaError::NotFound("nope".into())
        );
        assert!(registry.get(&missing).is_err());
        assert!(registry.get(&BundleId::builtin()).unwrap().is_builtin());
    }

    #[test]
    fn test_delete_rules() {
        let temp = TempDir::new().unwrap();
        let (registry, store) = registry(&temp);
        let current = registry.create("1.0.0").unwrap();
        let next = registry.create("1.1.0").unwrap();
        {
            let mut state = store.lock();
            state.current = current.id.clone();
            state.next = Some(next.id.clone());
        }

        assert!(matches!(registry.delete(&current.id), Err(OtaError::InUse(_))));
        assert!(matches!(registry.delete(&BundleId::builtin()), Err(OtaError::InUse(_))));

        std::fs::create_dir_all(registry.storage().bundle_dir(&next.id)).unwrap();
        registry.delete(&next.id).unwrap();
        assert!(store.snapshot().next.is_none());
        assert!(!registry.storage().bundle_dir(&next.id).exists());
        assert_eq!(registry.delete(&next.id).unwrap_err(), OtaError::NotFound(next.id.to_string()));
    }

    #[test]
    fn test_list_is_stable() {
        let temp = TempDir::new().unwrap();
        let (registry, _) = registry(&temp);
        for v in ["1.0.0", "1.1.0", "1.2.0"] {
            registry.create(v).unwrap();
        }
        let first: Vec<BundleId> = registry.list().into_iter().map(|b| b.id).collect();
        let second: Vec<BundleId> = registry.list().into_iter().map(|b| b.id).collect();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }
}
