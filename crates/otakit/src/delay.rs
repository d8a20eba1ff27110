//! Delay Scheduler - defers promotion of `next` until a condition holds.
//!
//! At most one directive is active. It is persisted with the rest of the
//! state so it survives restarts until it is consumed or cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{OtaError, OtaResult};
use crate::state::{PersistedState, StateStore};

/// Condition a directive waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DelayKind {
    /// App goes to background and comes back
    Background,
    /// Next full process restart
    Kill,
    /// Native app version becomes `value`
    NativeVersion,
    /// Wall clock reaches `value` (RFC 3339)
    Date,
}

impl DelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayKind::Background => "background",
            DelayKind::Kill => "kill",
            DelayKind::NativeVersion => "nativeVersion",
            DelayKind::Date => "date",
        }
    }

    pub fn parse(s: &str) -> OtaResult<Self> {
        match s {
            "background" => Ok(DelayKind::Background),
            "kill" => Ok(DelayKind::Kill),
            "nativeVersion" | "native_version" | "native-version" => Ok(DelayKind::NativeVersion),
            "date" => Ok(DelayKind::Date),
            other => Err(OtaError::InvalidArgument(format!(
                "Unknown delay kind '{}'. Valid values: background, kill, nativeVersion, date",
                other
            ))),
        }
    }
}

impl fmt::Display for DelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle checkpoints at which promotion is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    ProcessStart,
    Background,
    Foreground,
}

impl LifecycleEvent {
    pub fn parse(s: &str) -> OtaResult<Self> {
        match s {
            "start" | "process_start" | "processstart" => Ok(LifecycleEvent::ProcessStart),
            "background" => Ok(LifecycleEvent::Background),
            "foreground" => Ok(LifecycleEvent::Foreground),
            other => Err(OtaError::InvalidArgument(format!(
                "Unknown lifecycle event '{}'",
                other
            ))),
        }
    }
}

/// What a directive is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct DelayContext<'a> {
    pub event: LifecycleEvent,
    pub now: DateTime<Utc>,
    pub native_version: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayDirective {
    pub kind: DelayKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub set_at: DateTime<Utc>,
    /// A background transition was observed since the directive was set
    #[serde(default)]
    pub saw_background: bool,
}

impl DelayDirective {
    /// Build a directive, rejecting values the condition cannot be checked against
    pub fn new(kind: DelayKind, value: Option<String>, now: DateTime<Utc>) -> OtaResult<Self> {
        let value = value.filter(|v| !v.trim().is_empty());

        match kind {
            DelayKind::NativeVersion if value.is_none() => {
                return Err(OtaError::InvalidArgument(
                    "nativeVersion delay requires the target native version".into(),
                ));
            }
            DelayKind::Date => {
                let raw = value.as_deref().ok_or_else(|| {
                    OtaError::InvalidArgument("date delay requires an RFC 3339 timestamp".into())
                })?;
                parse_date(raw)?;
            }
            _ => {}
        }

        Ok(Self {
            kind,
            value,
            set_at: now,
            saw_background: false,
        })
    }

    /// Pure check of the condition against a lifecycle event and the clock
    pub fn is_satisfied(&self, ctx: &DelayContext<'_>) -> bool {
        match self.kind {
            DelayKind::Background => {
                self.saw_background && ctx.event == LifecycleEvent::Foreground
            }
            DelayKind::Kill => ctx.event == LifecycleEvent::ProcessStart,
            DelayKind::NativeVersion => self.value.as_deref() == Some(ctx.native_version),
            DelayKind::Date => match self.value.as_deref().map(parse_date) {
                Some(Ok(at)) => ctx.now >= at,
                _ => false,
            },
        }
    }

    /// Whether `observe` would change anything for this event
    pub fn records(&self, event: LifecycleEvent) -> bool {
        self.kind == DelayKind::Background
            && event == LifecycleEvent::Background
            && !self.saw_background
    }

    /// Record the event for conditions that span several events
    pub fn observe(&mut self, event: LifecycleEvent) {
        if self.records(event) {
            self.saw_background = true;
        }
    }
}

fn parse_date(raw: &str) -> OtaResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OtaError::InvalidArgument(format!("Invalid delay date '{}': {}", raw, e)))
}

/// Evaluate the active directive inside a state transaction.
///
/// Returns true when promotion may proceed. A satisfied directive is consumed.
pub fn evaluate(state: &mut PersistedState, ctx: &DelayContext<'_>) -> bool {
    let Some(directive) = state.delay.as_mut() else {
        return true;
    };

    directive.observe(ctx.event);
    if directive.is_satisfied(ctx) {
        info!("Delay directive {} satisfied on {:?}", directive.kind, ctx.event);
        state.delay = None;
        true
    } else {
        debug!("Delay directive {} still pending on {:?}", directive.kind, ctx.event);
        false
    }
}

/// Host-facing access to the directive
#[derive(Clone)]
pub struct DelayScheduler {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl DelayScheduler {
    pub fn new(store: Arc<StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Replace any existing directive
    pub fn set_delay(&self, kind: DelayKind, value: Option<String>) -> OtaResult<DelayDirective> {
        let directive = DelayDirective::new(kind, value, self.clock.now())?;
        let mut state = self.store.lock();
        if let Some(previous) = &state.delay {
            debug!("Replacing delay directive {}", previous.kind);
        }
        state.delay = Some(directive.clone());
        state.commit()?;
        info!(
            "Delay directive set: {} {}",
            directive.kind,
            directive.value.as_deref().unwrap_or("")
        );
        Ok(directive)
    }

    /// Clear the directive; idempotent
    pub fn cancel_delay(&self) -> OtaResult<()> {
        let mut state = self.store.lock();
        if state.delay.is_none() {
            return Ok(());
        }
        state.delay = None;
        state.commit()?;
        info!("Delay directive cancelled");
        Ok(())
    }

    pub fn current(&self) -> Option<DelayDirective> {
        self.store.lock().delay.clone()
    }
}
