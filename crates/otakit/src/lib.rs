//! otakit - over-the-air bundle updates for hybrid mobile apps.
//!
//! ```text
//! poller --> transport --> registry --> activation --(restart)--> readiness
//!                                          ^                         |
//!                                          +------- rollback --------+
//! ```
//!
//! [`Updater`] is the host-facing entry point. The host provides a
//! [`HostBridge`]; storage, transport and the update source have production
//! implementations that tests swap for fakes.

pub mod activation;
pub mod bundle;
pub mod clock;
pub mod config;
pub mod delay;
pub mod download;
pub mod error;
pub mod events;
pub mod host;
pub mod identity;
pub mod poller;
pub mod readiness;
pub mod reconcile;
pub mod registry;
pub mod state;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod updater;
pub mod version;

pub use activation::{ActivationController, ActivationPhase};
pub use bundle::{Bundle, BundleId, BundleStatus, BUILTIN_ID};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::UpdaterConfig;
pub use delay::{DelayDirective, DelayKind, LifecycleEvent};
pub use error::{OtaError, OtaResult};
pub use events::{EventEmitter, EventKind, ListenerHandle, UpdaterEvent};
pub use host::HostBridge;
pub use poller::{CheckOutcome, LatestRequest, LatestResponse, LatestVersion, UpdateSource};
pub use readiness::ReadinessRecord;
pub use reconcile::ReconcileReport;
pub use registry::BundleRegistry;
pub use stats::{StatsAction, StatsEvent, StatsReporter};
pub use storage::{FileStorage, Storage};
pub use transport::{DirectoryTransport, FetchOutcome, FetchRequest, HttpTransport, Transport};
pub use updater::{CurrentBundle, Updater, UpdaterBuilder};

/// Version of this library, reported to the update server
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
