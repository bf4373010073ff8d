use serde::Deserialize;

/// Registry id used when callers do not name one.
pub use fhirpkg_core::DEFAULT_REGISTRY as DEFAULT_REGISTRY_ID;

/// Public FHIR package registry.
pub const DEFAULT_REGISTRY_URL: &str = "https://packages.fhir.org";

/// Identifies a registry endpoint.
///
/// The default value points the `default` registry id at the public FHIR
/// package registry. Whoever constructs a cache decides whether to register
/// it; nothing is registered implicitly.
///
/// # Examples
///
/// ```
/// use fhirpkg_registry::RegistryConfig;
///
/// let config: RegistryConfig = serde_json::from_str(r#"{"url": "https://example.org"}"#).unwrap();
/// assert_eq!(config.id, "default");
/// assert_eq!(config.url, "https://example.org");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_url")]
    pub url: String,
}

impl RegistryConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            url: default_url(),
        }
    }
}

fn default_id() -> String {
    DEFAULT_REGISTRY_ID.to_string()
}

fn default_url() -> String {
    DEFAULT_REGISTRY_URL.to_string()
}
