//! Device identity, generated once per install.

use tracing::info;

use crate::error::OtaResult;
use crate::state::StateStore;

/// Return the persisted device id, creating it on first use
pub fn ensure_device_id(store: &StateStore) -> OtaResult<String> {
    let mut state = store.lock();
    if let Some(id) = &state.device_id {
        return Ok(id.clone());
    }

    let id = uuid::Uuid::new_v4().to_string();
    state.device_id = Some(id.clone());
    state.commit()?;
    info!("Generated device id {}", id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, Storage};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_device_id_is_stable() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp.path()));

        let first = ensure_device_id(&StateStore::open(storage.clone())).unwrap();
        let second = ensure_device_id(&StateStore::open(storage)).unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }
}
