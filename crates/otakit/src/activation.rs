//! Activation Controller - the `current`/`next` pointers and rollback.
//!
//! ```text
//!  NoPending --set_next--> PendingNext --promote/set--> Activating
//!                                                          |
//!                                   AwaitingConfirmation <-+
//!                                     |              |
//!                                 confirm         deadline
//!                                     v              v
//!                                 Confirmed       RolledBack
//! ```
//!
//! Every swap persists the new pointer and the readiness record in one state
//! transaction before the host is asked to reload.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::bundle::{Bundle, BundleId, BundleStatus};
use crate::clock::Clock;
use crate::config::UpdaterConfig;
use crate::delay::{self, DelayContext, LifecycleEvent};
use crate::error::{OtaError, OtaResult};
use crate::events::{EventEmitter, UpdaterEvent};
use crate::host::HostBridge;
use crate::readiness::{self, ReadinessMonitor, ReadinessRecord};
use crate::registry::BundleRegistry;
use crate::state::{PersistedState, StateGuard, StateStore};
use crate::stats::{StatsAction, StatsReporter};

/// Where the activation state machine currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivationPhase {
    NoPending,
    PendingNext,
    Activating,
    AwaitingConfirmation,
    Confirmed,
    RolledBack,
}

/// Everything the controller needs, shared with the rest of the updater
#[derive(Clone)]
pub struct ActivationDeps {
    pub store: Arc<StateStore>,
    pub registry: BundleRegistry,
    pub readiness: ReadinessMonitor,
    pub host: Arc<dyn HostBridge>,
    pub events: EventEmitter,
    pub stats: StatsReporter,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<UpdaterConfig>,
}

pub struct ActivationController {
    deps: ActivationDeps,
    /// Transient phases that cannot be derived from persisted state
    transient: Mutex<Option<ActivationPhase>>,
}

impl ActivationController {
    pub fn new(deps: ActivationDeps) -> Self {
        Self {
            deps,
            transient: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Bundle {
        self.deps.store.lock().current_bundle()
    }

    pub fn next(&self) -> Option<Bundle> {
        let state = self.deps.store.lock();
        state.next.as_ref().and_then(|id| state.bundle(id))
    }

    pub fn phase(&self) -> ActivationPhase {
        let transient = *self.transient();
        if transient == Some(ActivationPhase::Activating) {
            return ActivationPhase::Activating;
        }

        let state = self.deps.store.lock();
        if state.readiness.is_some() {
            ActivationPhase::AwaitingConfirmation
        } else if state.next.is_some() || state.staged.is_some() {
            ActivationPhase::PendingNext
        } else {
            transient.unwrap_or(ActivationPhase::NoPending)
        }
    }

    /// Queue a bundle for the next eligible restart
    pub fn set_next(&self, id: &BundleId) -> OtaResult<Bundle> {
        let bundle = {
            let mut state = self.deps.store.lock();
            let bundle = self.validate(&mut state, id)?;
            state.next = Some(bundle.id.clone());
            state.commit()?;
            bundle
        };

        info!("Bundle {} ({}) queued as next", bundle.id, bundle.version);
        self.transition(ActivationPhase::PendingNext);
        self.deps
            .stats
            .record(StatsAction::SetNext, &bundle.version, None);
        Ok(bundle)
    }

    /// Activate a bundle immediately
    pub fn set_current_and_reload(&self, id: &BundleId) -> OtaResult<Bundle> {
        let (bundle, previous) = {
            let mut state = self.deps.store.lock();
            let bundle = self.validate(&mut state, id)?;
            let previous = self.swap(&mut state, &bundle);
            state.commit()?;
            (bundle, previous)
        };

        self.deps
            .stats
            .record(StatsAction::Set, &bundle.version, Some(&previous.version));
        self.finish_swap(&bundle, &previous)?;
        Ok(bundle)
    }

    /// Promote `next` (or a staged bundle) when no delay directive holds it back
    ///
    /// Returns the newly current bundle when a swap happened.
    pub fn promote_next_if_due(&self, event: LifecycleEvent) -> OtaResult<Option<Bundle>> {
        let native_version = self.deps.host.native_version();
        let now = self.deps.clock.now();

        let (bundle, previous) = {
            let mut state = self.deps.store.lock();
            if state.next.is_none() && state.staged.is_none() {
                // A background seen before anything is queued still counts
                // toward a later foreground.
                if state.delay.as_ref().is_some_and(|d| d.records(event)) {
                    if let Some(directive) = state.delay.as_mut() {
                        directive.observe(event);
                    }
                    state.commit()?;
                }
                return Ok(None);
            }

            let ctx = DelayContext {
                event,
                now,
                native_version: &native_version,
            };
            // An unsatisfied directive may still have recorded the event;
            // the guard flushes that on the way out.
            if state.delay.is_some() && !delay::evaluate(&mut state, &ctx) {
                return Ok(None);
            }

            if let Some(staged) = state.staged.take() {
                debug!("Staged bundle {} becomes next", staged);
                state.next = Some(staged);
            }
            let Some(next) = state.next.clone() else {
                return Ok(None);
            };

            if next == state.current {
                state.next = None;
                state.commit()?;
                return Ok(None);
            }

            let bundle = match self.validate(&mut state, &next) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Dropping next pointer: {}", e);
                    state.next = None;
                    state.commit()?;
                    return Ok(None);
                }
            };

            let previous = self.swap(&mut state, &bundle);
            state.commit()?;
            (bundle, previous)
        };

        info!("Promoted next bundle {} on {:?}", bundle.id, event);
        self.deps
            .stats
            .record(StatsAction::Set, &bundle.version, Some(&previous.version));
        self.finish_swap(&bundle, &previous)?;
        Ok(Some(bundle))
    }

    /// Return to builtin, or to the last confirmed bundle when asked
    pub fn reset(&self, to_last_successful: bool) -> OtaResult<Bundle> {
        self.reset_excluding(to_last_successful, None)
    }

    /// Handle a readiness deadline that passed without confirmation
    pub fn rollback(&self, record: &ReadinessRecord) -> OtaResult<Bundle> {
        let failed_id = &record.bundle_id;
        let failure = OtaError::ActivationFailure {
            id: failed_id.to_string(),
        };
        warn!(
            "{} before {}, rolling back",
            failure,
            record.deadline.to_rfc3339()
        );

        let failed = match self.deps.registry.set_status(failed_id, BundleStatus::Error) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!("Could not mark {} as failed: {}", failed_id, e);
                self.deps.store.lock().bundle(failed_id)
            }
        };

        if let Some(bundle) = &failed {
            self.deps.events.emit(UpdaterEvent::UpdateFailed {
                bundle: bundle.clone(),
            });
            self.deps
                .stats
                .record(StatsAction::UpdateFail, &bundle.version, None);
        }

        let restored =
            self.reset_excluding(self.deps.config.rollback_to_last_successful, Some(failed_id))?;

        if self.deps.config.auto_delete_failed && !failed_id.is_builtin() {
            if let Err(e) = self.deps.registry.delete(failed_id) {
                warn!("Failed to delete rolled back bundle {}: {}", failed_id, e);
            }
        }

        self.transition(ActivationPhase::RolledBack);
        info!("Rolled back from {} to {}", failed_id, restored.id);
        Ok(restored)
    }

    /// Host confirmation that the current bundle works
    ///
    /// Without a pending activation this is a no-op returning the current bundle.
    pub fn confirm_ready(&self) -> OtaResult<Bundle> {
        let record = match self.deps.readiness.confirm() {
            Ok(record) => record,
            Err(OtaError::NoActivationPending) => {
                debug!("notifyAppReady with nothing pending");
                return Ok(self.current());
            }
            Err(e) => return Err(e),
        };

        self.transition(ActivationPhase::Confirmed);
        let current = self.current();
        self.deps
            .stats
            .record(StatsAction::AppReady, &current.version, None);

        if self.deps.config.auto_delete_previous {
            self.delete_previous(&record.previous);
        }
        Ok(current)
    }

    /// Ask the host to render the current bundle again
    pub fn reload(&self) -> OtaResult<()> {
        let current = self.current();
        self.reload_host(&current)
    }

    fn delete_previous(&self, previous: &BundleId) {
        if previous.is_builtin() {
            return;
        }
        {
            let state = self.deps.store.lock();
            let still_referenced = &state.current == previous
                || state.next.as_ref() == Some(previous)
                || state.staged.as_ref() == Some(previous);
            if still_referenced || !state.bundles.contains_key(previous) {
                return;
            }
        }

        match self.deps.registry.delete(previous) {
            Ok(()) => info!("Deleted previous bundle {}", previous),
            Err(e) => warn!("Failed to delete previous bundle {}: {}", previous, e),
        }
    }

    fn reset_excluding(
        &self,
        to_last_successful: bool,
        exclude: Option<&BundleId>,
    ) -> OtaResult<Bundle> {
        let (target, previous) = {
            let mut state = self.deps.store.lock();
            let known_good = if to_last_successful {
                self.last_known_good(&state, exclude)
            } else {
                None
            };
            let target = known_good.unwrap_or_else(Bundle::builtin);

            let previous = state.current_bundle();
            state.current = target.id.clone();
            state.next = None;
            state.staged = None;
            state.readiness = None;
            state.commit()?;
            (target, previous)
        };

        info!("Reset from {} to {}", previous.id, target.id);
        self.deps
            .stats
            .record(StatsAction::Reset, &target.version, Some(&previous.version));
        self.reload_host(&target)?;
        Ok(target)
    }

    /// Most recently confirmed bundle that is still usable
    fn last_known_good(&self, state: &PersistedState, exclude: Option<&BundleId>) -> Option<Bundle> {
        let storage = self.deps.store.storage();
        state
            .known_good
            .iter()
            .rev()
            .filter(|id| **id != state.current && Some(*id) != exclude)
            .filter_map(|id| state.bundles.get(id))
            .find(|bundle| {
                bundle.status == BundleStatus::Success
                    && storage.has_entry_file(&bundle.id, &self.deps.config.entry_file)
            })
            .cloned()
    }

    /// Check a pointer target; a `success` bundle with no entry file is marked `error`
    fn validate(&self, state: &mut StateGuard<'_>, id: &BundleId) -> OtaResult<Bundle> {
        if id.is_builtin() {
            return Ok(Bundle::builtin());
        }

        let bundle = state
            .bundles
            .get(id)
            .cloned()
            .ok_or_else(|| OtaError::NotFound(id.to_string()))?;

        if bundle.status != BundleStatus::Success {
            return Err(OtaError::invalid_bundle(
                id.as_str(),
                format!("status is {}", bundle.status),
            ));
        }

        let entry_file = &self.deps.config.entry_file;
        if !self.deps.store.storage().has_entry_file(id, entry_file) {
            error!("Bundle {} is missing its entry file {}", id, entry_file);
            if let Some(stored) = state.bundles.get_mut(id) {
                stored.status = BundleStatus::Error;
            }
            return Err(OtaError::invalid_bundle(
                id.as_str(),
                format!("missing entry file {}", entry_file),
            ));
        }

        Ok(bundle)
    }

    /// Pointer swap plus readiness arming; returns the bundle that was current
    fn swap(&self, state: &mut StateGuard<'_>, target: &Bundle) -> Bundle {
        self.transition(ActivationPhase::Activating);

        let previous = state.current_bundle();
        state.current = target.id.clone();
        if state.next.as_ref() == Some(&target.id) {
            state.next = None;
        }
        if state.staged.as_ref() == Some(&target.id) {
            state.staged = None;
        }

        if target.is_builtin() {
            state.readiness = None;
        } else {
            readiness::arm(
                state,
                &target.id,
                &previous.id,
                self.deps.clock.now(),
                self.deps.config.app_ready_timeout(),
            );
        }
        previous
    }

    fn finish_swap(&self, bundle: &Bundle, previous: &Bundle) -> OtaResult<()> {
        info!(
            "Activated bundle {} ({}), previous {}",
            bundle.id, bundle.version, previous.id
        );
        let result = self.reload_host(bundle);
        self.clear_transient(ActivationPhase::Activating);
        result
    }

    fn reload_host(&self, bundle: &Bundle) -> OtaResult<()> {
        let path = if bundle.is_builtin() {
            None
        } else {
            Some(self.deps.store.storage().bundle_dir(&bundle.id))
        };
        self.deps.host.reload(bundle, path.as_deref())
    }

    fn transition(&self, to: ActivationPhase) {
        let mut transient = self.transient();
        debug!("Activation phase {:?} -> {:?}", *transient, to);
        *transient = match to {
            ActivationPhase::Activating
            | ActivationPhase::Confirmed
            | ActivationPhase::RolledBack => Some(to),
            _ => None,
        };
    }

    fn clear_transient(&self, phase: ActivationPhase) {
        let mut transient = self.transient();
        if *transient == Some(phase) {
            *transient = None;
        }
    }

    fn transient(&self) -> std::sync::MutexGuard<'_, Option<ActivationPhase>> {
        self.transient.lock().unwrap_or_else(|e| e.into_inner())
    }
}
