//! Readiness Monitor - watchdog for freshly activated bundles.
//!
//! A record is armed in the same state transaction as the swap that made a
//! bundle current. The host removes it by confirming readiness. The deadline
//! is checked at the next process start rather than with an in-process timer:
//! a bundle that crashes on launch would take the timer down with it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::bundle::BundleId;
use crate::clock::Clock;
use crate::error::{OtaError, OtaResult};
use crate::state::{PersistedState, StateStore};

/// One activation attempt awaiting confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessRecord {
    pub bundle_id: BundleId,
    /// Bundle that was current before this activation
    pub previous: BundleId,
    pub armed_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl ReadinessRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// Arm a fresh record; replaces any earlier one
pub fn arm(
    state: &mut PersistedState,
    bundle_id: &BundleId,
    previous: &BundleId,
    now: DateTime<Utc>,
    timeout: Duration,
) -> ReadinessRecord {
    let record = ReadinessRecord {
        bundle_id: bundle_id.clone(),
        previous: previous.clone(),
        armed_at: now,
        deadline: now + timeout,
    };
    debug!(
        "Readiness armed for {} until {}",
        record.bundle_id,
        record.deadline.to_rfc3339()
    );
    state.readiness = Some(record.clone());
    record
}

#[derive(Clone)]
pub struct ReadinessMonitor {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl ReadinessMonitor {
    pub fn new(store: Arc<StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Host signal that the current bundle launched successfully
    pub fn confirm(&self) -> OtaResult<ReadinessRecord> {
        let mut state = self.store.lock();
        let record = state.readiness.clone().ok_or(OtaError::NoActivationPending)?;
        state.readiness = None;
        state.mark_known_good(&record.bundle_id);
        state.commit()?;
        info!("Bundle {} confirmed ready", record.bundle_id);
        Ok(record)
    }

    /// Record whose deadline passed without confirmation
    pub fn expired(&self) -> Option<ReadinessRecord> {
        let now = self.clock.now();
        self.store
            .lock()
            .readiness
            .as_ref()
            .filter(|record| record.is_expired(now))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{FileStorage, Storage};
    use tempfile::TempDir;

    fn monitor(temp: &TempDir) -> (ReadinessMonitor, Arc<StateStore>, ManualClock) {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp.path()));
        let store = Arc::new(StateStore::open(storage));
        let clock = ManualClock::new(Utc::now());
        let monitor = ReadinessMonitor::new(store.clone(), Arc::new(clock.clone()));
        (monitor, store, clock)
    }

    #[test]
    fn test_confirm_without_record() {
        let temp = TempDir::new().unwrap();
        let (monitor, _, _) = monitor(&temp);
        assert_eq!(monitor.confirm().unwrap_err(), OtaError::NoActivationPending);
    }

    #[test]
    fn test_confirm_clears_record() {
        let temp = TempDir::new().unwrap();
        let (monitor, store, clock) = monitor(&temp);
        let id = BundleId::from("b1");
        {
            let mut state = store.lock();
            arm(&mut state, &id, &BundleId::builtin(), clock.now(), Duration::seconds(10));
        }

        let record = monitor.confirm().unwrap();
        assert_eq!(record.bundle_id, id);
        assert!(store.snapshot().readiness.is_none());
        assert_eq!(store.snapshot().known_good, vec![id]);
        // A second confirmation has nothing left to confirm
        assert!(monitor.confirm().is_err());
    }

    #[test]
    fn test_expiry() {
        let temp = TempDir::new().unwrap();
        let (monitor, store, clock) = monitor(&temp);
        {
            let mut state = store.lock();
            arm(
                &mut state,
                &BundleId::from("b1"),
                &BundleId::builtin(),
                clock.now(),
                Duration::milliseconds(10_000),
            );
        }

        assert!(monitor.expired().is_none());
        clock.advance(Duration::milliseconds(9_999));
        assert!(monitor.expired().is_none());
        clock.advance(Duration::milliseconds(1));
        assert!(monitor.expired().is_some());
    }
}
