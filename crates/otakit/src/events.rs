//! Event Emitter - listener registry for host notifications.
//!
//! ```text
//! +-----------+     +--------------+     +-----------------+
//! | updater   | --> | EventEmitter | --> | host listeners  |
//! | (emits)   |     | (per kind)   |     | (callbacks)     |
//! +-----------+     +--------------+     +-----------------+
//! ```
//!
//! Delivery is synchronous and serialized per event kind, so `download`
//! progress always reaches a listener before `downloadComplete`. Listeners
//! must not emit events of their own kind from inside the callback.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::bundle::Bundle;

/// Kind of event a listener subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Download,
    DownloadComplete,
    DownloadFailed,
    MajorAvailable,
    UpdateFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Download,
        EventKind::DownloadComplete,
        EventKind::DownloadFailed,
        EventKind::MajorAvailable,
        EventKind::UpdateFailed,
    ];
}

/// Event delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum UpdaterEvent {
    /// Download progress, 0-100
    Download { percent: u8, bundle: Bundle },
    DownloadComplete { bundle: Bundle },
    DownloadFailed { version: String },
    /// A major update exists but was not applied automatically
    MajorAvailable { version: String },
    /// A bundle failed to confirm readiness and was rolled back
    UpdateFailed { bundle: Bundle },
}

impl UpdaterEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UpdaterEvent::Download { .. } => EventKind::Download,
            UpdaterEvent::DownloadComplete { .. } => EventKind::DownloadComplete,
            UpdaterEvent::DownloadFailed { .. } => EventKind::DownloadFailed,
            UpdaterEvent::MajorAvailable { .. } => EventKind::MajorAvailable,
            UpdaterEvent::UpdateFailed { .. } => EventKind::UpdateFailed,
        }
    }
}

type Listener = Arc<dyn Fn(&UpdaterEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(u64, Listener)>>,
}

struct Shared {
    registry: Mutex<Registry>,
    /// One delivery lock per kind
    delivery: HashMap<EventKind, Mutex<()>>,
}

#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let delivery = EventKind::ALL
            .iter()
            .map(|kind| (*kind, Mutex::new(())))
            .collect();
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                delivery,
            }),
        }
    }

    /// Register a listener; the returned handle removes it
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&UpdaterEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));

        ListenerHandle {
            id,
            kind,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn remove_all_listeners(&self) {
        self.registry().listeners.clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry().listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every listener of its kind, in subscription order
    pub fn emit(&self, event: UpdaterEvent) {
        let kind = event.kind();
        let _delivery = self
            .shared
            .delivery
            .get(&kind)
            .map(|lock| lock.lock().unwrap_or_else(|e| e.into_inner()));

        // Snapshot so listeners may subscribe or unsubscribe while we deliver
        let listeners: Vec<Listener> = self
            .registry()
            .listeners
            .get(&kind)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(&event);
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Cancellation handle for one listener
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    kind: EventKind,
    shared: Weak<Shared>,
}

impl ListenerHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Stop delivering events to this listener
    pub fn remove(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = registry.listeners.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}
