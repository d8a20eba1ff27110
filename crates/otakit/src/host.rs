//! Host bridge - what the core needs from the embedding application.

use std::path::Path;

use crate::bundle::Bundle;
use crate::error::OtaResult;

/// Services provided by the host app
///
/// `reload` is only ever called after the new `current` pointer has been
/// persisted.
pub trait HostBridge: Send + Sync {
    /// Start rendering `bundle`. `path` is `None` for the builtin assets.
    fn reload(&self, bundle: &Bundle, path: Option<&Path>) -> OtaResult<()>;

    /// Version of the installed app-store binary
    fn native_version(&self) -> String;

    /// Platform name used for config scoping and server requests
    fn platform(&self) -> String;
}
