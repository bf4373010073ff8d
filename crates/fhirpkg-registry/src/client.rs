//! Registry protocol client.
//!
//! A registry answers `GET {base}/{name}/{version}` either with the tarball
//! itself (`application/gzip`, `application/tar+gzip`) or with a small JSON
//! document whose `dist.tarball` field points at the archive:
//!
//! ```json
//! { "dist": { "shasum": "...", "tarball": "https://...", "unpackedSize": 1234 } }
//! ```
//!
//! The client follows that indirection and hands back the raw, still
//! compressed byte stream. Decompression and unpacking are left to the
//! caller.

use crate::config::RegistryConfig;
use async_trait::async_trait;
use bytes::Bytes;
use fhirpkg_core::{PkgError, Result};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Request, Response, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;

const USER_AGENT: &str = concat!("fhirpkg/", env!("CARGO_PKG_VERSION"));

/// Anything able to execute an HTTP request.
///
/// `reqwest::Client` implements this directly. Authenticating transports
/// wrap a client and decorate requests before sending them.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl HttpTransport for reqwest::Client {
    async fn execute(&self, request: Request) -> Result<Response> {
        let url = request.url().to_string();
        reqwest::Client::execute(self, request)
            .await
            .map_err(|e| PkgError::transport(url, e))
    }
}

/// Compressed tarball bytes returned by [`RegistryClient::fetch`].
pub struct TarballStream {
    /// URL the body is read from; differs from the metadata URL for
    /// indirect downloads.
    pub url: String,
    /// Body chunks. A failed read carries the `reqwest::Error` as its
    /// source, see [`PkgError::map_body_failure`].
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
    /// Length declared by the response, if any.
    pub content_length: Option<u64>,
}

impl TarballStream {
    fn from_response(response: Response) -> Self {
        Self {
            url: response.url().to_string(),
            content_length: response.content_length(),
            body: response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed(),
        }
    }

    /// Buffers the whole body.
    pub async fn into_bytes(self) -> std::io::Result<Vec<u8>> {
        self.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }
}

impl std::fmt::Debug for TarballStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarballStream")
            .field("url", &self.url)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Client for a single registry endpoint.
///
/// # Examples
///
/// ```no_run
/// use fhirpkg_registry::RegistryClient;
///
/// # #[tokio::main]
/// # async fn main() -> fhirpkg_core::Result<()> {
/// let client = RegistryClient::new("https://packages.fhir.org");
/// let tarball = client.fetch("hl7.fhir.r4.core", "4.0.1").await?;
/// println!("{:?} bytes", tarball.content_length);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RegistryClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
}

impl RegistryClient {
    /// Creates a client backed by a plain `reqwest::Client`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to create HTTP client");
        Self::with_transport(base_url, Arc::new(client))
    }

    /// Creates a client that sends requests through `transport`.
    pub fn with_transport(base_url: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches the tarball for `name` at exactly `version`.
    ///
    /// # Errors
    ///
    /// - `PkgError::Status` for a non-200 response on either request
    /// - `PkgError::BadContentType` for an unsupported content type
    /// - `PkgError::BadContent` for an undecodable JSON document or one
    ///   without a tarball URL
    /// - `PkgError::Transport` when the request cannot be sent
    pub async fn fetch(&self, name: &str, version: &str) -> Result<TarballStream> {
        let url = format!("{}/{}/{}", self.base_url.trim_end_matches('/'), name, version);
        let response = self.get(&url).await?;

        let content_type = media_type(&response);
        match content_type.as_str() {
            "application/gzip" | "application/tar+gzip" => {
                Ok(TarballStream::from_response(response))
            }
            "application/json" => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| PkgError::transport(url.as_str(), e))?;
                let tarball = parse_tarball_url(&url, &body)?;
                tracing::debug!("{}@{} resolved to {}", name, version, tarball);

                let response = self.get(&tarball).await?;
                Ok(TarballStream::from_response(response))
            }
            other => Err(PkgError::BadContentType(other.to_string())),
        }
    }

    async fn get(&self, url: &str) -> Result<Response> {
        let parsed = Url::parse(url)
            .map_err(|e| PkgError::invalid_arguments(format!("invalid URL {}: {}", url, e)))?;
        tracing::debug!("GET {}", url);

        let response = self
            .transport
            .execute(Request::new(Method::GET, parsed))
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(PkgError::status(
                url,
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
            ));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Content type without parameters, lowercased.
fn media_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    dist: Dist,
}

/// Distribution info. `shasum` and `unpacked_size` are decoded but not
/// checked against the downloaded bytes.
#[derive(Deserialize, Default)]
#[allow(dead_code)]
struct Dist {
    #[serde(default)]
    shasum: String,
    #[serde(default)]
    tarball: String,
    #[serde(default, rename = "unpackedSize")]
    unpacked_size: i64,
}

fn parse_tarball_url(url: &str, body: &[u8]) -> Result<String> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| PkgError::bad_content(url, e.to_string()))?;
    if envelope.dist.tarball.is_empty() {
        return Err(PkgError::bad_content(url, "missing dist.tarball"));
    }
    Ok(envelope.dist.tarball)
}
