//! Package manifests and unpacked packages.
//!
//! A package directory is considered present when it holds a
//! [`MANIFEST_FILE`]. Only `name`, `version` and `dependencies` carry meaning
//! for caching and dependency expansion; the remaining fields are passed
//! through to consumers untouched.

use crate::error::{PkgError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the manifest inside an unpacked package directory.
pub const MANIFEST_FILE: &str = "package.json";

/// Subset of `package.json` read by the cache and downloader.
///
/// # Examples
///
/// ```
/// use fhirpkg_core::PackageManifest;
///
/// let json = r#"{
///     "name": "hl7.fhir.us.core",
///     "version": "6.1.0",
///     "fhir-version-list": ["4.0.1"],
///     "dependencies": { "hl7.fhir.r4.core": "4.0.1" }
/// }"#;
///
/// let manifest = PackageManifest::from_slice(json.as_bytes()).unwrap();
/// assert_eq!(manifest.name, "hl7.fhir.us.core");
/// assert_eq!(manifest.dependencies["hl7.fhir.r4.core"], "4.0.1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(
        default,
        rename = "fhir-version-list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub fhir_version_list: Vec<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub package_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Numeric in published packages, but some older tooling wrote strings.
    #[serde(
        default,
        rename = "tools-version",
        skip_serializing_if = "Option::is_none"
    )]
    pub tools_version: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

impl PackageManifest {
    /// Parses a manifest from raw `package.json` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Reads `package.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns `PkgError::NotFound` if the manifest file does not exist and
    /// `PkgError::Json` if it cannot be decoded.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let data = std::fs::read(&path).map_err(|e| not_found_or_io(e, path))?;
        Self::from_slice(&data)
    }
}

/// Maps `ErrorKind::NotFound` to [`PkgError::NotFound`] for the given path.
pub fn not_found_or_io(error: std::io::Error, path: PathBuf) -> PkgError {
    if error.kind() == std::io::ErrorKind::NotFound {
        PkgError::NotFound { path }
    } else {
        PkgError::Io(error)
    }
}

/// A manifest paired with the directory the package was unpacked into.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub manifest: PackageManifest,
    pub path: PathBuf,
}

impl Package {
    pub fn new(manifest: PackageManifest, path: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            path: path.into(),
        }
    }

    /// Opens an already unpacked package directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let path = dir.into();
        let manifest = PackageManifest::from_dir(&path)?;
        Ok(Self { manifest, path })
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn dependencies(&self) -> &BTreeMap<String, String> {
        &self.manifest.dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const US_CORE: &str = r#"{
  "name": "hl7.fhir.us.core",
  "version": "6.1.0",
  "fhir-version-list": ["4.0.1"],
  "type": "IG",
  "tools-version": 3,
  "license": "CC0-1.0",
  "canonical": "http://hl7.org/fhir/us/core",
  "dependencies": {
    "hl7.fhir.r4.core": "4.0.1",
    "hl7.terminology.r4": "5.0.0"
  },
  "maintainers": [{ "name": "HL7" }]
}"#;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = PackageManifest::from_slice(US_CORE.as_bytes()).unwrap();
        assert_eq!(manifest.name, "hl7.fhir.us.core");
        assert_eq!(manifest.version, "6.1.0");
        assert_eq!(manifest.fhir_version_list, vec!["4.0.1".to_string()]);
        assert_eq!(manifest.package_type.as_deref(), Some("IG"));
        assert_eq!(manifest.tools_version, Some(serde_json::json!(3)));
        assert_eq!(manifest.dependencies.len(), 2);
        assert_eq!(
            manifest.canonical.as_deref(),
            Some("http://hl7.org/fhir/us/core")
        );
    }

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = PackageManifest::from_slice(br#"{"name":"a","version":"1"}"#).unwrap();
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.license.is_none());
    }

    #[test]
    fn test_parse_invalid_manifest() {
        let result = PackageManifest::from_slice(b"not json");
        assert!(matches!(result, Err(PkgError::Json(_))));
    }

    #[test]
    fn test_open_missing_dir_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Package::open(dir.path().join("absent")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_open_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), US_CORE).unwrap();

        let package = Package::open(dir.path()).unwrap();
        assert_eq!(package.name(), "hl7.fhir.us.core");
        assert_eq!(package.version(), "6.1.0");
        assert_eq!(package.path, dir.path());
        assert!(package.dependencies().contains_key("hl7.terminology.r4"));
    }
}
