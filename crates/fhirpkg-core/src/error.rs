use std::path::PathBuf;
use thiserror::Error;

/// Error type shared by every fhirpkg crate.
///
/// Variants are grouped by where the failure originates: caller input
/// (`InvalidArguments`, `UnknownRegistry`), the local cache (`NotFound`),
/// the network (`Status`, `Transport`), the registry protocol
/// (`BadContentType`, `BadContent`) and the tarball itself (`Archive`).
///
/// # Examples
///
/// ```
/// use fhirpkg_core::error::{PkgError, Result};
///
/// fn require(registry: &str) -> Result<()> {
///     if registry.is_empty() {
///         return Err(PkgError::invalid_arguments("registry is required"));
///     }
///     Ok(())
/// }
///
/// assert!(require("").is_err());
/// ```
#[derive(Error, Debug)]
pub enum PkgError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown registry: {0}")]
    UnknownRegistry(String),

    #[error("package not found at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("unexpected status code {code} {reason} for {url}")]
    Status {
        url: String,
        code: u16,
        reason: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("bad content type: {0}")]
    BadContentType(String),

    #[error("bad content from {url}: {message}")]
    BadContent { url: String, message: String },

    #[error("archive error: {0}")]
    Archive(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Task(String),
}

impl PkgError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub fn unknown_registry(registry: impl Into<String>) -> Self {
        Self::UnknownRegistry(registry.into())
    }

    pub fn status(url: impl Into<String>, code: u16, reason: impl Into<String>) -> Self {
        Self::Status {
            url: url.into(),
            code,
            reason: reason.into(),
        }
    }

    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    pub fn bad_content(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadContent {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Turns an archive or I/O error whose source is a failed response body
    /// read back into a `Transport` error for `url`.
    pub fn map_body_failure(self, url: &str) -> Self {
        match self {
            Self::Archive(e) => e
                .downcast::<reqwest::Error>()
                .map_or_else(Self::Archive, |source| Self::transport(url, source)),
            Self::Io(e) => e
                .downcast::<reqwest::Error>()
                .map_or_else(Self::Io, |source| Self::transport(url, source)),
            other => other,
        }
    }

    /// Returns `true` if the package manifest was absent on disk.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_unknown_registry(&self) -> bool {
        matches!(self, Self::UnknownRegistry(_))
    }

    /// HTTP status code carried by a `Status` error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Convenience alias for `Result<T, PkgError>`.
pub type Result<T> = std::result::Result<T, PkgError>;
