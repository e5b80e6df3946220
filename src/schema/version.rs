//! Protocol version catalog and negotiation.
//!
//! Versions are ordered by release. A version's release ordinal is the
//! "release point" table validity windows are measured against.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One protocol version known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Version string exchanged in the handshake.
    pub name: String,
    /// Release ordinal, increasing with release date.
    pub release: u32,
    /// Whether clients may still negotiate this version.
    pub supported: bool,
}

impl ProtocolVersion {
    /// Create a version entry.
    pub fn new(name: impl Into<String>, release: u32, supported: bool) -> Self {
        Self {
            name: name.into(),
            release,
            supported,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Ordered catalog of protocol versions.
#[derive(Debug, Clone, Default)]
pub struct VersionCatalog {
    versions: Vec<ProtocolVersion>,
}

impl VersionCatalog {
    /// Build a catalog; entries are ordered by release.
    pub fn new(mut versions: Vec<ProtocolVersion>) -> Self {
        versions.sort_by_key(|v| v.release);
        Self { versions }
    }

    /// All versions, oldest first.
    pub fn versions(&self) -> &[ProtocolVersion] {
        &self.versions
    }

    /// Look up a version by exact name.
    pub fn get(&self, name: &str) -> Option<&ProtocolVersion> {
        self.versions.iter().find(|v| v.name == name)
    }

    /// Names of versions that may be negotiated, oldest first.
    pub fn supported_names(&self) -> Vec<String> {
        self.versions
            .iter()
            .filter(|v| v.supported)
            .map(|v| v.name.clone())
            .collect()
    }

    /// Resolve a client version string to a supported version.
    ///
    /// An exact supported match wins. Otherwise a pre-release or build
    /// suffix (`-SNAPSHOT`, `+build.7`) is stripped and the base version is
    /// tried. Anything else is unsupported.
    pub fn resolve(&self, requested: &str) -> Option<&ProtocolVersion> {
        let requested = requested.trim();
        if let Some(version) = self.get(requested).filter(|v| v.supported) {
            return Some(version);
        }
        let base = requested
            .split(['-', '+'])
            .next()
            .filter(|base| !base.is_empty() && *base != requested)?;
        self.get(base).filter(|v| v.supported)
    }

    /// Restrict negotiation to the named versions.
    ///
    /// Versions outside `allowed` stay in the catalog for table validity
    /// computations but can no longer be negotiated.
    pub fn restrict_to(&mut self, allowed: &[String]) {
        for version in &mut self.versions {
            if !allowed.iter().any(|name| name == &version.name) {
                version.supported = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> VersionCatalog {
        VersionCatalog::new(vec![
            ProtocolVersion::new("1.30", 2, true),
            ProtocolVersion::new("1.0", 1, false),
            ProtocolVersion::new("1.83.0", 3, true),
        ])
    }

    #[test]
    fn ordered_by_release() {
        let names: Vec<_> = catalog().versions().iter().map(|v| v.name.clone()).collect();
        assert_eq!(names, vec!["1.0", "1.30", "1.83.0"]);
    }

    #[test]
    fn resolve_exact_and_suffixed() {
        let catalog = catalog();
        assert_eq!(catalog.resolve("1.30").map(|v| v.release), Some(2));
        assert_eq!(catalog.resolve(" 1.83.0 ").map(|v| v.release), Some(3));
        assert_eq!(catalog.resolve("1.83.0-SNAPSHOT").map(|v| v.release), Some(3));
        assert_eq!(catalog.resolve("1.83.0+build.7").map(|v| v.release), Some(3));
    }

    #[test]
    fn resolve_rejects_unknown_and_retired() {
        let catalog = catalog();
        assert!(catalog.resolve("9.9.9").is_none());
        assert!(catalog.resolve("1.0").is_none());
        assert!(catalog.resolve("").is_none());
        assert!(catalog.resolve("-SNAPSHOT").is_none());
    }

    #[test]
    fn restrict_keeps_entries() {
        let mut catalog = catalog();
        catalog.restrict_to(&["1.83.0".to_string()]);
        assert_eq!(catalog.supported_names(), vec!["1.83.0".to_string()]);
        assert!(catalog.get("1.30").is_some());
        assert!(catalog.resolve("1.30").is_none());
    }
}
