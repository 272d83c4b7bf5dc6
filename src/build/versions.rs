//! Base image table
//!
//! Maps a builder and a version to the base image its recipe starts from. The
//! table is compiled in and parsed on first use.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::Deserialize;

const VERSIONS_JSON: &str = include_str!("versions.json");

/// A pinned base image
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Version {
    pub image: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub digest: Option<String>,
}

impl Version {
    /// `image@digest` when a digest is pinned, `image:tag` otherwise, or
    /// `None` when neither is usable
    pub fn reference(&self) -> Option<String> {
        if self.image.is_empty() {
            return None;
        }
        match self.digest.as_deref() {
            Some(digest) if !digest.is_empty() => Some(format!("{}@{digest}", self.image)),
            _ if !self.tag.is_empty() => Some(format!("{}:{}", self.image, self.tag)),
            _ => None,
        }
    }
}

type Table = BTreeMap<String, BTreeMap<String, Version>>;

fn table() -> &'static Table {
    static TABLE: OnceLock<Table> = OnceLock::new();
    TABLE.get_or_init(|| match serde_json::from_str(VERSIONS_JSON) {
        Ok(table) => table,
        Err(e) => {
            tracing::warn!(error = %e, "unreadable base image table, using defaults");
            Table::new()
        }
    })
}

/// Look up `builder`/`version`
pub fn lookup(builder: &str, version: &str) -> Option<&'static Version> {
    table().get(builder)?.get(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_table_parses() {
        let parsed: Table = serde_json::from_str(VERSIONS_JSON).unwrap();
        assert!(parsed.contains_key("node"));
        assert!(parsed.contains_key("python"));
    }

    #[test]
    fn test_lookup() {
        assert!(lookup("python", "3").is_some());
        assert!(lookup("node", "20").is_some());
        assert!(lookup("node", "0.10").is_none());
        assert!(lookup("cobol", "1").is_none());
    }

    #[test]
    fn test_reference_prefers_digest() {
        let pinned = Version {
            image: "node".into(),
            tag: "18".into(),
            digest: Some("sha256:abc".into()),
        };
        assert_eq!(pinned.reference().as_deref(), Some("node@sha256:abc"));

        let tagged = Version {
            digest: None,
            ..pinned.clone()
        };
        assert_eq!(tagged.reference().as_deref(), Some("node:18"));

        assert_eq!(Version::default().reference(), None);
    }
}
