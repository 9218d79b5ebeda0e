//! Kit catalog.
//!
//! Kit manifests are parsed by an external tool; by the time they reach the
//! daemon each kit has been reduced to an `{image, command, capabilities}`
//! tuple, stored as JSON at `$AEGIS_HOME/kits.json`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use aegis_shared::errors::{AegisError, AegisResult};

/// One resolved kit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kit {
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// All kits known to this daemon.
#[derive(Debug, Clone, Default)]
pub struct KitCatalog {
    kits: BTreeMap<String, Kit>,
}

impl KitCatalog {
    /// Load the catalog; an absent file is an empty catalog.
    pub fn load(path: &Path) -> AegisResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AegisError::Io(format!("read {}: {e}", path.display())))?;
        let kits: BTreeMap<String, Kit> = serde_json::from_str(&raw)
            .map_err(|e| AegisError::Fatal(format!("parse {}: {e}", path.display())))?;
        Ok(Self { kits })
    }

    pub fn resolve(&self, name: &str) -> AegisResult<&Kit> {
        self.kits
            .get(name)
            .ok_or_else(|| AegisError::NotFound(format!("kit \"{name}\" is not installed")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.kits.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Kit)> {
        self.kits.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_is_empty_catalog() {
        let catalog = KitCatalog::load(Path::new("/nonexistent/kits.json")).unwrap();
        assert!(catalog.names().is_empty());
        assert!(catalog.resolve("coder").is_err());
    }

    #[test]
    fn resolve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kits.json");
        std::fs::write(
            &path,
            r#"{"coder": {"image": "ghcr.io/aegis/coder:1", "command": ["/usr/bin/agent"], "capabilities": ["net"]}}"#,
        )
        .unwrap();

        let catalog = KitCatalog::load(&path).unwrap();
        let kit = catalog.resolve("coder").unwrap();
        assert_eq!(kit.image, "ghcr.io/aegis/coder:1");
        assert_eq!(kit.command, vec!["/usr/bin/agent"]);
        assert_eq!(catalog.names(), vec!["coder"]);
    }
}
