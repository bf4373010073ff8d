//! On-disk package cache.
//!
//! Packages live at `{root}/{stripped registry URL}/{name}/{version}`, with
//! every JSON file of the tarball flattened into that directory. A package
//! counts as cached once its `package.json` exists there.
//!
//! The reserved registry id [`LOCAL_REGISTRY`] never touches the network or
//! the cache root: it maps `name@version` to directories registered with
//! [`Cache::add_local_package`].

use crate::listener::{CacheListener, ListenerSet, PackageKey};
use dashmap::DashMap;
use fhirpkg_core::archive::{Archive, DiskUnpacker, Unpacker, unpacker_fn};
use fhirpkg_core::manifest::not_found_or_io;
use fhirpkg_core::{MANIFEST_FILE, Package, PackageManifest, PkgError, Result};
use fhirpkg_registry::{RegistryClient, RegistryConfig, TarballStream};
use futures::{StreamExt, TryStreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;

/// Registry id of the in-memory local overlay.
pub const LOCAL_REGISTRY: &str = "local";

/// Per-package index shipped in tarballs; never copied into the cache.
const INDEX_FILE: &str = ".index.json";

/// Package cache rooted at a directory.
///
/// All methods take `&self`; a cache is typically shared behind an `Arc`
/// between a [`Downloader`](crate::Downloader) and other callers.
///
/// # Examples
///
/// ```no_run
/// use fhirpkg_cache::Cache;
/// use fhirpkg_registry::RegistryConfig;
///
/// # #[tokio::main]
/// # async fn main() -> fhirpkg_core::Result<()> {
/// let cache = Cache::with_default_registry("/tmp/fhir-cache", &RegistryConfig::default());
/// let package = cache.get_or_fetch("default", "hl7.fhir.r4.core", "4.0.1").await?;
/// println!("{}", package.path.display());
/// # Ok(())
/// # }
/// ```
pub struct Cache {
    root: PathBuf,
    clients: DashMap<String, RegistryClient>,
    local: DashMap<String, PathBuf>,
    listeners: RwLock<ListenerSet>,
}

impl Cache {
    /// Creates an empty cache with no registries registered.
    ///
    /// A relative `root` is made absolute against the working directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            root,
            clients: DashMap::new(),
            local: DashMap::new(),
            listeners: RwLock::new(ListenerSet::default()),
        }
    }

    /// Creates a cache with a client for `config` already registered.
    pub fn with_default_registry(root: impl Into<PathBuf>, config: &RegistryConfig) -> Self {
        let cache = Self::new(root);
        cache.add_client(config.id.clone(), RegistryClient::from_config(config));
        cache
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers (or replaces) the client serving `registry`.
    pub fn add_client(&self, registry: impl Into<String>, client: RegistryClient) {
        self.clients.insert(registry.into(), client);
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Makes `path` available as `local::{package}@{version}`.
    pub fn add_local_package(
        &self,
        package: impl AsRef<str>,
        version: impl AsRef<str>,
        path: impl Into<PathBuf>,
    ) {
        self.local.insert(
            local_key(package.as_ref(), version.as_ref()),
            path.into(),
        );
    }

    /// Directory a package is (or would be) cached in.
    ///
    /// Returns `None` when an argument is empty, the registry is unknown, or
    /// a local package has not been registered.
    pub fn cache_dir(&self, registry: &str, package: &str, version: &str) -> Option<PathBuf> {
        if registry.is_empty() || package.is_empty() || version.is_empty() {
            return None;
        }
        if registry == LOCAL_REGISTRY {
            return self
                .local
                .get(&local_key(package, version))
                .map(|path| path.value().clone());
        }

        let client = self.clients.get(registry)?;
        Some(
            self.root
                .join(strip_url(client.base_url()))
                .join(package)
                .join(version),
        )
    }

    /// Returns `true` if the package manifest exists on disk.
    ///
    /// This is a single blocking `stat`; the async operations below check
    /// through `tokio::fs` instead.
    pub fn contains(&self, registry: &str, package: &str, version: &str) -> bool {
        self.cache_dir(registry, package, version)
            .is_some_and(|dir| dir.join(MANIFEST_FILE).is_file())
    }

    async fn is_cached(&self, registry: &str, package: &str, version: &str) -> bool {
        match self.cache_dir(registry, package, version) {
            Some(dir) => tokio::fs::metadata(dir.join(MANIFEST_FILE))
                .await
                .is_ok_and(|meta| meta.is_file()),
            None => false,
        }
    }

    /// Downloads the package unless it is already cached.
    pub async fn fetch(&self, registry: &str, package: &str, version: &str) -> Result<()> {
        self.fetch_until(registry, package, version, &CancellationToken::new())
            .await
    }

    /// [`fetch`](Self::fetch) that gives up once `cancel` fires.
    pub async fn fetch_until(
        &self,
        registry: &str,
        package: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_cached(registry, package, version).await {
            self.listeners()
                .cache_hit(&PackageKey::new(registry, package, version));
            return Ok(());
        }
        self.force_fetch_until(registry, package, version, cancel)
            .await
    }

    /// Downloads and unpacks the package, overwriting any cached files.
    ///
    /// Local packages are never downloaded; they always report a cache hit.
    ///
    /// # Errors
    ///
    /// Returns `PkgError::InvalidArguments` for empty arguments,
    /// `PkgError::UnknownRegistry` when no client serves `registry`, and any
    /// transport, protocol or archive error raised while downloading.
    pub async fn force_fetch(&self, registry: &str, package: &str, version: &str) -> Result<()> {
        self.force_fetch_until(registry, package, version, &CancellationToken::new())
            .await
    }

    /// [`force_fetch`](Self::force_fetch) that gives up once `cancel` fires.
    ///
    /// A cancelled download returns `PkgError::Cancelled` and still ends with
    /// a `fetch_end` event carrying that error. Files already written stay on
    /// disk.
    pub async fn force_fetch_until(
        &self,
        registry: &str,
        package: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        require_key(registry, package, version)?;
        let key = PackageKey::new(registry, package, version);
        let listeners = self.listeners();

        if registry == LOCAL_REGISTRY {
            listeners.cache_hit(&key);
            return Ok(());
        }

        let client = self
            .clients
            .get(registry)
            .map(|c| c.value().clone())
            .ok_or_else(|| PkgError::unknown_registry(registry))?;
        let dir = self
            .cache_dir(registry, package, version)
            .ok_or_else(|| PkgError::unknown_registry(registry))?;

        listeners.fetch_begin(&key);
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PkgError::Cancelled),
            result = download(&client, &key, dir, listeners.clone(), cancel) => result,
        };
        if let Err(e) = &result {
            tracing::warn!("fetching {} failed: {}", key, e);
        }
        listeners.fetch_end(&key, result.as_ref().err());
        result
    }

    /// Opens a cached package without touching the network.
    ///
    /// # Errors
    ///
    /// Returns `PkgError::NotFound` if the package has not been fetched.
    pub async fn get(&self, registry: &str, package: &str, version: &str) -> Result<Package> {
        require_key(registry, package, version)?;
        let dir = self
            .cache_dir(registry, package, version)
            .ok_or_else(|| PkgError::unknown_registry(registry))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let data = tokio::fs::read(&manifest_path)
            .await
            .map_err(|e| not_found_or_io(e, manifest_path))?;
        let manifest = PackageManifest::from_slice(&data)?;
        Ok(Package::new(manifest, dir))
    }

    /// Fetches the package if needed, then opens it.
    pub async fn get_or_fetch(
        &self,
        registry: &str,
        package: &str,
        version: &str,
    ) -> Result<Package> {
        self.get_or_fetch_until(registry, package, version, &CancellationToken::new())
            .await
    }

    /// [`get_or_fetch`](Self::get_or_fetch) that gives up once `cancel` fires.
    pub async fn get_or_fetch_until(
        &self,
        registry: &str,
        package: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Package> {
        if !self.is_cached(registry, package, version).await {
            self.fetch_until(registry, package, version, cancel).await?;
        }
        self.get(registry, package, version).await
    }

    /// Removes a package from the cache, or a local package from the
    /// overlay. Removing something that is not there is not an error.
    pub async fn delete(&self, registry: &str, package: &str, version: &str) -> Result<()> {
        require_key(registry, package, version)?;
        if registry == LOCAL_REGISTRY {
            self.local.remove(&local_key(package, version));
            return Ok(());
        }

        let dir = self
            .cache_dir(registry, package, version)
            .ok_or_else(|| PkgError::unknown_registry(registry))?;
        self.listeners()
            .delete(&PackageKey::new(registry, package, version), &dir);

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn listeners(&self) -> ListenerSet {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.root)
            .field("registries", &self.clients.len())
            .field("local_packages", &self.local.len())
            .finish_non_exhaustive()
    }
}

fn require_key(registry: &str, package: &str, version: &str) -> Result<()> {
    if registry.is_empty() || package.is_empty() || version.is_empty() {
        return Err(PkgError::invalid_arguments(format!(
            "registry, package and version are required (got {:?}, {:?}, {:?})",
            registry, package, version
        )));
    }
    Ok(())
}

fn local_key(package: &str, version: &str) -> String {
    format!("{}@{}", package, version)
}

/// Streams the registry response straight into the unpacker.
///
/// The archive is read on the blocking pool through a sync bridge over the
/// async body, so the tarball is never buffered in full. Cancelling ends
/// the body early, which stops the blocking reader.
async fn download(
    client: &RegistryClient,
    key: &PackageKey,
    dir: PathBuf,
    listeners: ListenerSet,
    cancel: &CancellationToken,
) -> Result<()> {
    let TarballStream {
        url,
        body,
        content_length,
    } = client.fetch(&key.package, &key.version).await?;
    tracing::debug!(
        "downloading {} from {} ({:?} bytes) into {}",
        key,
        url,
        content_length,
        dir.display()
    );

    let progress = listeners.clone();
    let progress_key = key.clone();
    let body = body
        .take_until(Box::pin(cancel.clone().cancelled_owned()))
        .inspect_ok(move |chunk| progress.fetch_progress(&progress_key, chunk.len()));
    let reader = SyncIoBridge::new(StreamReader::new(body));

    let key = key.clone();
    tokio::task::spawn_blocking(move || unpack_package(reader, &dir, &key, &listeners))
        .await
        .map_err(|e| PkgError::Task(e.to_string()))?
        .map_err(|e| e.map_body_failure(&url))
}

fn unpack_package(
    reader: impl Read,
    dir: &Path,
    key: &PackageKey,
    listeners: &ListenerSet,
) -> Result<()> {
    let progress = listeners.clone();
    let progress_key = key.clone();
    let mut disk = DiskUnpacker::new(dir)
        .with_observer(move |bytes| progress.unpack_progress(&progress_key, bytes));

    Archive::new(reader)
        .with_filter(is_package_file)
        .with_transform(|name| base_name(name).to_string())
        .unpack(&mut unpacker_fn(|name, size, entry| {
            listeners.unpack_file(key, name, size);
            disk.unpack(name, size, entry)
        }))
}

fn is_package_file(name: &str) -> bool {
    name.ends_with(".json") && base_name(name) != INDEX_FILE
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Turns a registry URL into a relative cache path.
///
/// Scheme, credentials, port, query and fragment are dropped; the host and
/// the remaining path segments become directory components.
///
/// # Examples
///
/// ```
/// use fhirpkg_cache::cache::strip_url;
/// use std::path::PathBuf;
///
/// assert_eq!(strip_url("https://example.org:8443/fhir/?x=1"), PathBuf::from("example.org/fhir"));
/// ```
pub fn strip_url(url: &str) -> PathBuf {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.split(['?', '#']).next().unwrap_or_default();

    let mut segments = rest
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..");
    let mut path = PathBuf::new();
    if let Some(authority) = segments.next() {
        let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
        path.push(strip_port(host));
    }
    for segment in segments {
        path.push(segment);
    }
    path
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
