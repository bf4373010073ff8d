use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Registry id assumed when a reference omits one.
pub const DEFAULT_REGISTRY: &str = "default";

/// Compact `registry::name@version` identifier for a package.
///
/// Parsing never fails. A missing or empty registry falls back to
/// [`DEFAULT_REGISTRY`], a missing `@` yields an empty version, and any
/// further separators end up inside the name. Callers should not assume a
/// parsed reference is well formed just because its fields are non-empty.
///
/// # Examples
///
/// ```
/// use fhirpkg_core::PackageRef;
///
/// let r = PackageRef::parse("simplifier::hl7.fhir.r4.core@4.0.1");
/// assert_eq!(r.registry(), "simplifier");
/// assert_eq!(r.name(), "hl7.fhir.r4.core");
/// assert_eq!(r.version(), "4.0.1");
///
/// let r = PackageRef::parse("hl7.fhir.r4.core");
/// assert_eq!(r.registry(), "default");
/// assert_eq!(r.version(), "");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    registry: String,
    name: String,
    version: String,
}

impl PackageRef {
    pub fn new(
        registry: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let registry = registry.into();
        Self {
            registry: if registry.is_empty() {
                DEFAULT_REGISTRY.to_string()
            } else {
                registry
            },
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn parse(s: &str) -> Self {
        let (registry, rest) = match s.split_once("::") {
            Some((registry, rest)) => (registry, rest),
            None => ("", s),
        };
        let (name, version) = match rest.rsplit_once('@') {
            Some((name, version)) => (name, version),
            None => (rest, ""),
        };
        Self::new(registry, name, version)
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FromStr for PackageRef {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}@{}", self.registry, self.name, self.version)
    }
}
