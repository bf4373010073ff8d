//! Cache lifecycle notifications.
//!
//! Listeners are called synchronously on whichever task or blocking thread
//! performs the cache operation. Downloads run concurrently, so a listener
//! may be invoked from several threads at once and must do its own
//! synchronization.

use fhirpkg_core::PkgError;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Identity of a cached package: registry id, name and exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageKey {
    pub registry: String,
    pub package: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(
        registry: impl Into<String>,
        package: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            package: package.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}@{}", self.registry, self.package, self.version)
    }
}

/// Observer of cache activity. Every method defaults to a no-op.
///
/// A successful download produces, in order: `fetch_begin`, any number of
/// `fetch_progress`, `unpack_file` and `unpack_progress` calls, then
/// `fetch_end` with `None`. A failed or cancelled download still ends with
/// `fetch_end`, carrying the error.
pub trait CacheListener: Send + Sync {
    fn fetch_begin(&self, _key: &PackageKey) {}

    fn fetch_end(&self, _key: &PackageKey, _error: Option<&PkgError>) {}

    /// `bytes` were received from the registry.
    fn fetch_progress(&self, _key: &PackageKey, _bytes: usize) {}

    /// `bytes` were written while unpacking.
    fn unpack_progress(&self, _key: &PackageKey, _bytes: usize) {}

    /// A file is about to be written into the package directory.
    fn unpack_file(&self, _key: &PackageKey, _name: &str, _size: u64) {}

    /// The package was already present; nothing was downloaded.
    fn cache_hit(&self, _key: &PackageKey) {}

    /// The package directory is about to be removed.
    fn delete(&self, _key: &PackageKey, _path: &Path) {}
}

/// Ordered list of listeners, itself a listener that forwards each event to
/// every member in registration order.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn CacheListener>>,
}

impl ListenerSet {
    pub fn push(&mut self, listener: Arc<dyn CacheListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each(&self, f: impl Fn(&dyn CacheListener)) {
        for listener in &self.listeners {
            f(listener.as_ref());
        }
    }
}

impl CacheListener for ListenerSet {
    fn fetch_begin(&self, key: &PackageKey) {
        self.each(|l| l.fetch_begin(key));
    }

    fn fetch_end(&self, key: &PackageKey, error: Option<&PkgError>) {
        self.each(|l| l.fetch_end(key, error));
    }

    fn fetch_progress(&self, key: &PackageKey, bytes: usize) {
        self.each(|l| l.fetch_progress(key, bytes));
    }

    fn unpack_progress(&self, key: &PackageKey, bytes: usize) {
        self.each(|l| l.unpack_progress(key, bytes));
    }

    fn unpack_file(&self, key: &PackageKey, name: &str, size: u64) {
        self.each(|l| l.unpack_file(key, name, size));
    }

    fn cache_hit(&self, key: &PackageKey) {
        self.each(|l| l.cache_hit(key));
    }

    fn delete(&self, key: &PackageKey, path: &Path) {
        self.each(|l| l.delete(key, path));
    }
}

/// Emits cache events as `tracing` events.
///
/// Byte progress is logged at `trace`, per-file events at `debug`, and
/// fetch lifecycle events at `info` (or `warn` for failures).
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl CacheListener for TracingListener {
    fn fetch_begin(&self, key: &PackageKey) {
        tracing::info!(package = %key, "fetching package");
    }

    fn fetch_end(&self, key: &PackageKey, error: Option<&PkgError>) {
        match error {
            None => tracing::info!(package = %key, "fetched package"),
            Some(e) => tracing::warn!(package = %key, error = %e, "failed to fetch package"),
        }
    }

    fn fetch_progress(&self, key: &PackageKey, bytes: usize) {
        tracing::trace!(package = %key, bytes, "received");
    }

    fn unpack_progress(&self, key: &PackageKey, bytes: usize) {
        tracing::trace!(package = %key, bytes, "unpacked");
    }

    fn unpack_file(&self, key: &PackageKey, name: &str, size: u64) {
        tracing::debug!(package = %key, file = name, size, "unpacking file");
    }

    fn cache_hit(&self, key: &PackageKey) {
        tracing::debug!(package = %key, "cache hit");
    }

    fn delete(&self, key: &PackageKey, path: &Path) {
        tracing::info!(package = %key, path = %path.display(), "deleting package");
    }
}
