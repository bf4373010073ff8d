//! Core types for fhirpkg.
//!
//! This crate holds everything the registry client and the package cache
//! share:
//! - **Errors**: [`PkgError`] and the crate-wide [`Result`] alias
//! - **Manifests**: [`PackageManifest`] and unpacked [`Package`]s
//! - **References**: [`PackageRef`] (`registry::name@version`)
//! - **Archives**: streaming tarball unpacking with filters and sinks
//! - **Config**: the default [`CacheLocation`]

pub mod archive;
pub mod config;
pub mod error;
pub mod manifest;
pub mod package_ref;

pub use archive::{Archive, DiskUnpacker, MultiUnpacker, Unpacker, unpacker_fn};
pub use config::CacheLocation;
pub use error::{PkgError, Result};
pub use manifest::{MANIFEST_FILE, Package, PackageManifest};
pub use package_ref::{DEFAULT_REGISTRY, PackageRef};
