//! Registry protocol client for fhirpkg.
//!
//! [`RegistryClient`] talks to one registry endpoint over an
//! [`HttpTransport`] and returns the package tarball as a byte stream,
//! following JSON indirection when the registry serves metadata instead of
//! the archive itself.

pub mod client;
pub mod config;

pub use client::{HttpTransport, RegistryClient, TarballStream};
pub use config::{DEFAULT_REGISTRY_URL, RegistryConfig};
