//! On-disk FHIR package cache and concurrent downloader.
//!
//! - [`Cache`] maps `(registry, package, version)` to a directory below a
//!   cache root, downloading and unpacking tarballs on demand
//! - [`CacheListener`] observes fetches, unpacking, cache hits and deletes
//! - [`Downloader`] resolves packages and their transitive dependencies
//!   with a pool of concurrent workers, fetching each key at most once

pub mod cache;
pub mod downloader;
pub mod listener;

pub use cache::{Cache, LOCAL_REGISTRY};
pub use downloader::{DownloadReport, DownloadRequest, Downloader};
pub use listener::{CacheListener, ListenerSet, PackageKey, TracingListener};
