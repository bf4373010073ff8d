//! Concurrent dependency downloader.
//!
//! A [`Downloader`] walks the dependency graph of its root requests with a
//! fixed pool of tokio tasks. Every `(registry, package, version)` key is
//! claimed exactly once through a concurrent set, so a package reachable
//! through several paths is fetched once. The first failure cancels the
//! whole run.
//!
//! Because dependency expansion feeds the queue while it is drained, the
//! queue length says nothing about completion. Instead an outstanding-work
//! counter is incremented for every enqueued request and decremented once a
//! request (duplicate or not) is fully processed. When it drops to zero the
//! queue is closed and idle workers exit.

use crate::cache::Cache;
use dashmap::DashSet;
use fhirpkg_core::{Package, PackageRef, PkgError, Result};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::listener::PackageKey;

/// A package to resolve, optionally together with its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub registry: String,
    pub package: String,
    pub version: String,
    pub include_dependencies: bool,
}

impl DownloadRequest {
    pub fn new(
        registry: impl Into<String>,
        package: impl Into<String>,
        version: impl Into<String>,
        include_dependencies: bool,
    ) -> Self {
        Self {
            registry: registry.into(),
            package: package.into(),
            version: version.into(),
            include_dependencies,
        }
    }

    pub fn from_ref(package: &PackageRef, include_dependencies: bool) -> Self {
        Self::new(
            package.registry(),
            package.name(),
            package.version(),
            include_dependencies,
        )
    }

    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.registry, &self.package, &self.version)
    }
}

/// Packages resolved by a successful run, one per distinct key, in
/// completion order.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub packages: Vec<Package>,
}

/// Resolves root requests and their transitive dependencies through a
/// [`Cache`].
///
/// # Examples
///
/// ```no_run
/// use fhirpkg_cache::{Cache, DownloadRequest, Downloader};
/// use fhirpkg_registry::RegistryConfig;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> fhirpkg_core::Result<()> {
/// let cache = Arc::new(Cache::with_default_registry("/tmp/fhir", &RegistryConfig::default()));
/// let downloader = Downloader::new(cache).with_workers(4);
/// downloader.add(DownloadRequest::new("default", "hl7.fhir.us.core", "6.1.0", true));
///
/// let report = downloader.run(CancellationToken::new()).await?;
/// println!("{} packages", report.packages.len());
/// # Ok(())
/// # }
/// ```
pub struct Downloader {
    cache: Arc<Cache>,
    requests: Mutex<Vec<DownloadRequest>>,
    workers: usize,
    force: bool,
}

impl Downloader {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            requests: Mutex::new(Vec::new()),
            workers: default_workers(),
            force: false,
        }
    }

    /// Sets the number of concurrent workers; `0` selects the host's
    /// available parallelism.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 {
            default_workers()
        } else {
            workers
        };
        self
    }

    /// Re-download packages even when they are already cached.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Adds a root request. Safe to call from several threads before
    /// [`run`](Self::run); requests added while a run is in progress are not
    /// picked up by that run.
    pub fn add(&self, request: DownloadRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }

    /// Resolves every root request and, where asked, its dependencies.
    ///
    /// Returns as soon as the queue is drained, the first request fails, or
    /// `cancel` is triggered. In-flight downloads are abandoned on failure or
    /// cancellation and report `PkgError::Cancelled` through `fetch_end`.
    /// Packages fetched before a failure stay cached.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any worker, or
    /// `PkgError::Cancelled` if `cancel` fired first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DownloadReport> {
        let roots = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracing::info!(
            "downloading {} root packages with {} workers",
            roots.len(),
            self.workers
        );

        let queue = Arc::new(WorkQueue::new());
        for request in roots {
            queue.push(request);
        }
        if queue.is_drained() {
            return Ok(DownloadReport::default());
        }

        let state = Arc::new(RunState {
            cache: Arc::clone(&self.cache),
            force: self.force,
            claimed: DashSet::new(),
            packages: Mutex::new(Vec::new()),
            first_error: Mutex::new(None),
            token: cancel.child_token(),
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            workers.spawn(worker(Arc::clone(&state), Arc::clone(&queue)));
        }

        // Workers stop on the run token themselves; joining instead of
        // aborting lets every in-flight fetch deliver its fetch_end.
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                state.fail(PkgError::Task(e.to_string()));
            }
        }

        if let Some(error) = state.take_error() {
            return Err(error);
        }
        if state.token.is_cancelled() {
            return Err(PkgError::Cancelled);
        }

        let packages = std::mem::take(
            &mut *state
                .packages
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::info!("downloaded {} packages", packages.len());
        Ok(DownloadReport { packages })
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("workers", &self.workers)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Shared queue with an outstanding-work counter.
struct WorkQueue {
    tx: mpsc::UnboundedSender<DownloadRequest>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DownloadRequest>>,
    outstanding: AtomicUsize,
    drained: CancellationToken,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            outstanding: AtomicUsize::new(0),
            drained: CancellationToken::new(),
        }
    }

    /// Never blocks; the channel is unbounded.
    fn push(&self, request: DownloadRequest) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.complete();
        }
    }

    async fn pop(&self) -> Option<DownloadRequest> {
        self.rx.lock().await.recv().await
    }

    /// Marks one request as fully processed.
    fn complete(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.cancel();
        }
    }

    fn is_drained(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }
}

struct RunState {
    cache: Arc<Cache>,
    force: bool,
    claimed: DashSet<PackageKey>,
    packages: Mutex<Vec<Package>>,
    first_error: Mutex<Option<PkgError>>,
    token: CancellationToken,
}

impl RunState {
    /// Records `error` unless an earlier one exists, then cancels the run.
    fn fail(&self, error: PkgError) {
        let mut slot = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.token.cancel();
    }

    fn take_error(&self) -> Option<PkgError> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn process(&self, request: DownloadRequest, queue: &WorkQueue) -> Result<()> {
        if !self.claimed.insert(request.key()) {
            tracing::trace!("{} already claimed", request.key());
            return Ok(());
        }

        let DownloadRequest {
            registry,
            package,
            version,
            include_dependencies,
        } = request;

        let resolved = if self.force {
            self.cache
                .force_fetch_until(&registry, &package, &version, &self.token)
                .await?;
            self.cache.get(&registry, &package, &version).await?
        } else {
            self.cache
                .get_or_fetch_until(&registry, &package, &version, &self.token)
                .await?
        };

        if include_dependencies {
            for (name, dep_version) in resolved.dependencies() {
                queue.push(DownloadRequest::new(
                    registry.as_str(),
                    name.as_str(),
                    dep_version.as_str(),
                    true,
                ));
            }
        }

        self.packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resolved);
        Ok(())
    }
}

async fn worker(state: Arc<RunState>, queue: Arc<WorkQueue>) {
    loop {
        let request = tokio::select! {
            biased;
            () = state.token.cancelled() => return,
            () = queue.drained.cancelled() => return,
            request = queue.pop() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let result = state.process(request, &queue).await;
        queue.complete();

        match result {
            Ok(()) => {}
            Err(PkgError::Cancelled) => return,
            Err(e) => {
                tracing::debug!("download failed, cancelling run: {}", e);
                state.fail(e);
                return;
            }
        }
    }
}
