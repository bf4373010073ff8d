use std::path::PathBuf;

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "FHIRPKG_CACHE";

/// Directory name used below the home directory, or relative to the
/// working directory when no home directory is known.
pub const CACHE_DIR_NAME: &str = ".fhirpkg";

/// Default on-disk location of the package cache.
///
/// Resolution order:
/// 1. `FHIRPKG_CACHE`, when set and non-empty
/// 2. `~/.fhirpkg`
/// 3. `.fhirpkg` relative to the working directory
///
/// # Examples
///
/// ```
/// use fhirpkg_core::config::CacheLocation;
/// use std::path::PathBuf;
///
/// let location = CacheLocation::from_parts(None, Some(PathBuf::from("/home/me")));
/// assert_eq!(location.root(), PathBuf::from("/home/me/.fhirpkg").as_path());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    root: PathBuf,
}

impl CacheLocation {
    /// Resolves the location from the process environment.
    pub fn resolve() -> Self {
        Self::from_parts(std::env::var(CACHE_DIR_ENV).ok(), dirs::home_dir())
    }

    /// Resolves the location from an explicit override and home directory.
    pub fn from_parts(env_value: Option<String>, home: Option<PathBuf>) -> Self {
        let root = match (env_value.filter(|v| !v.is_empty()), home) {
            (Some(value), _) => PathBuf::from(value),
            (None, Some(home)) => home.join(CACHE_DIR_NAME),
            (None, None) => PathBuf::from(CACHE_DIR_NAME),
        };
        tracing::debug!("package cache root: {}", root.display());
        Self { root }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn into_path(self) -> PathBuf {
        self.root
    }
}

impl Default for CacheLocation {
    fn default() -> Self {
        Self::resolve()
    }
}
