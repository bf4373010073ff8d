//! Shared helpers for cache and downloader integration tests: tarball
//! builders, registry mocks and a recording listener.

use async_trait::async_trait;
use fhirpkg_cache::{CacheListener, PackageKey};
use fhirpkg_core::PkgError;
use fhirpkg_registry::HttpTransport;
use flate2::Compression;
use flate2::write::GzEncoder;
use mockito::{Mock, ServerGuard};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Builds a gzip tarball laid out like a published FHIR package.
pub(crate) fn package_tarball(name: &str, version: &str, dependencies: &[(&str, &str)]) -> Vec<u8> {
    let deps: serde_json::Map<String, serde_json::Value> = dependencies
        .iter()
        .map(|(n, v)| (n.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    let manifest = serde_json::json!({
        "name": name,
        "version": version,
        "fhir-version-list": ["4.0.1"],
        "dependencies": deps,
    });

    tarball(&[
        ("package/package.json", manifest.to_string().as_bytes()),
        ("package/.index.json", br#"{"index-version":1,"files":[]}"#),
        (
            "package/StructureDefinition-Foo.json",
            br#"{"resourceType":"StructureDefinition"}"#,
        ),
        ("package/other/ValueSet-bar.json", br#"{"resourceType":"ValueSet"}"#),
        ("package/readme.md", b"# readme"),
    ])
}

pub(crate) fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// Serves `body` as a direct tarball for `GET /{name}/{version}`.
pub(crate) async fn mock_tarball(
    server: &mut ServerGuard,
    name: &str,
    version: &str,
    body: Vec<u8>,
    hits: usize,
) -> Mock {
    server
        .mock("GET", format!("/{}/{}", name, version).as_str())
        .with_status(200)
        .with_header("content-type", "application/tar+gzip")
        .with_body(body)
        .expect(hits)
        .create_async()
        .await
}

/// Serves a package tarball with the given dependencies.
pub(crate) async fn mock_package(
    server: &mut ServerGuard,
    name: &str,
    version: &str,
    dependencies: &[(&str, &str)],
    hits: usize,
) -> Mock {
    let body = package_tarball(name, version, dependencies);
    mock_tarball(server, name, version, body, hits).await
}

#[allow(dead_code)] // Not every test binary inspects logs
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every event as a compact string.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
    fetched_bytes: AtomicUsize,
    unpacked_bytes: AtomicUsize,
}

#[allow(dead_code)] // Not every test binary uses every accessor
impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub(crate) fn fetched_bytes(&self) -> usize {
        self.fetched_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn unpacked_bytes(&self) -> usize {
        self.unpacked_bytes.load(Ordering::SeqCst)
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl CacheListener for RecordingListener {
    fn fetch_begin(&self, key: &PackageKey) {
        self.record(format!("fetch_begin {}", key));
    }

    fn fetch_end(&self, key: &PackageKey, error: Option<&PkgError>) {
        let outcome = if error.is_some() { "err" } else { "ok" };
        self.record(format!("fetch_end {} {}", key, outcome));
    }

    fn fetch_progress(&self, _key: &PackageKey, bytes: usize) {
        self.fetched_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    fn unpack_progress(&self, _key: &PackageKey, bytes: usize) {
        self.unpacked_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    fn unpack_file(&self, key: &PackageKey, name: &str, _size: u64) {
        self.record(format!("unpack_file {} {}", key, name));
    }

    fn cache_hit(&self, key: &PackageKey) {
        self.record(format!("cache_hit {}", key));
    }

    fn delete(&self, key: &PackageKey, _path: &Path) {
        self.record(format!("delete {}", key));
    }
}

/// Sends requests through reqwest, except that a request for the stalled
/// path never completes and one for the delayed path waits first.
#[allow(dead_code)]
pub(crate) struct StallingTransport {
    client: reqwest::Client,
    stalled: String,
    delayed: Option<(String, Duration)>,
}

#[allow(dead_code)]
impl StallingTransport {
    pub(crate) fn new(stalled: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            stalled: stalled.to_string(),
            delayed: None,
        }
    }

    pub(crate) fn with_delay(mut self, path: &str, delay: Duration) -> Self {
        self.delayed = Some((path.to_string(), delay));
        self
    }
}

#[async_trait]
impl HttpTransport for StallingTransport {
    async fn execute(&self, request: reqwest::Request) -> fhirpkg_core::Result<reqwest::Response> {
        let path = request.url().path().to_string();
        if path == self.stalled {
            std::future::pending::<()>().await;
        }
        if let Some((delayed, delay)) = &self.delayed
            && path == *delayed
        {
            tokio::time::sleep(*delay).await;
        }
        HttpTransport::execute(&self.client, request).await
    }
}
