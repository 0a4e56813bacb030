//! The per-job property bag threaded through pipeline stages.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::paths;
use crate::{Error, Result};

/// Insertion-ordered, write-once key/value context for one job.
///
/// Top-level keys may hold nested objects, addressed with dotted keys such as
/// `location.path` or `windows.instanceId`. Every workspace path stored
/// through [`insert_path`](Self::insert_path) is absolute and inside the base
/// directory.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyBag {
    #[serde(skip)]
    base_dir: PathBuf,
    #[serde(flatten)]
    values: Map<String, Value>,
}

impl PropertyBag {
    /// Create an empty bag rooted at an absolute workspace directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.is_absolute() {
            return Err(Error::InvalidInput(format!(
                "workspace directory must be absolute: {}",
                base_dir.display()
            )));
        }
        Ok(Self {
            base_dir: paths::normalize(&base_dir),
            values: Map::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Insert a new top-level key. Existing keys are never overwritten.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(Error::Conflict(format!("property \"{key}\" is already set")));
        }
        self.values.insert(key, serde_json::to_value(value)?);
        Ok(())
    }

    /// Resolve `relative` inside the workspace and return the absolute path.
    pub fn workspace_path(&self, relative: &str) -> Result<PathBuf> {
        paths::resolve_within(&self.base_dir, relative)
    }

    /// Check that an absolute path lies inside the workspace.
    pub fn ensure_within(&self, path: &Path) -> Result<PathBuf> {
        if !path.is_absolute() || !paths::is_within(&self.base_dir, path) {
            return Err(Error::Traversal {
                path: path.display().to_string(),
            });
        }
        Ok(paths::normalize(path))
    }

    /// Merge every key of `other`, failing on the first key already present.
    ///
    /// The bag is left untouched when a conflict is found.
    pub fn merge(&mut self, other: Map<String, Value>) -> Result<()> {
        if let Some(key) = other.keys().find(|k| self.values.contains_key(*k)) {
            return Err(Error::Conflict(format!("property \"{key}\" is already set")));
        }
        self.values.extend(other);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Look up a value by dotted key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut current = self.values.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn require(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| Error::MissingProperty(key.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| Error::MissingProperty(format!("{key} (expected a string)")))
    }

    /// A workspace path property, re-checked against the base directory.
    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        let raw = self.get_str(key)?;
        self.ensure_within(Path::new(raw))
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.require(key)?.clone();
        serde_json::from_value(value)
            .map_err(|e| Error::MissingProperty(format!("{key} has an unexpected shape: {e}")))
    }

    /// A string map property; absent keys yield an empty map.
    pub fn get_string_map(&self, key: &str) -> Result<BTreeMap<String, String>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(BTreeMap::new()),
            Some(_) => self.get_as(key),
        }
    }

    /// A list of strings; absent keys yield an empty list.
    pub fn get_string_list(&self, key: &str) -> Result<Vec<String>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(_) => self.get_as(key),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag() -> PropertyBag {
        PropertyBag::new("/tmp/hal").unwrap()
    }

    #[test]
    fn test_requires_absolute_base() {
        assert!(PropertyBag::new("relative/dir").is_err());
    }

    #[test]
    fn test_insert_is_write_once() {
        let mut bag = bag();
        bag.insert("method", "rsync").unwrap();
        let err = bag.insert("method", "s3").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(bag.get_str("method").unwrap(), "rsync");
    }

    #[test]
    fn test_dotted_lookup() {
        let mut bag = bag();
        bag.insert(
            "location",
            json!({"path": "/tmp/hal/hal9000-push-1234", "archive": "/archive/hal9000-1.tar.gz"}),
        )
        .unwrap();
        assert_eq!(bag.get_str("location.path").unwrap(), "/tmp/hal/hal9000-push-1234");
        assert!(bag.get("location.missing").is_none());
        assert!(matches!(
            bag.get_str("windows.instanceId"),
            Err(Error::MissingProperty(_))
        ));
    }

    #[test]
    fn test_preserves_insertion_order() {
        let mut bag = bag();
        bag.insert("zeta", 1).unwrap();
        bag.insert("alpha", 2).unwrap();
        bag.insert("mid", 3).unwrap();
        assert_eq!(bag.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_get_path_rejects_outside_workspace() {
        let mut bag = bag();
        bag.insert("location", json!({"inside": "/tmp/hal/job", "outside": "/tmp/hal/../etc"}))
            .unwrap();
        assert_eq!(bag.get_path("location.inside").unwrap(), PathBuf::from("/tmp/hal/job"));
        assert!(matches!(
            bag.get_path("location.outside"),
            Err(Error::Traversal { .. })
        ));
    }

    #[test]
    fn test_merge_rejects_conflicts_atomically() {
        let mut bag = bag();
        bag.insert("a", 1).unwrap();
        let mut other = Map::new();
        other.insert("b".to_string(), json!(2));
        other.insert("a".to_string(), json!(3));
        assert!(bag.merge(other).is_err());
        assert!(!bag.contains("b"));
    }

    #[test]
    fn test_missing_lists_are_empty() {
        let bag = bag();
        assert!(bag.get_string_list("configuration.build").unwrap().is_empty());
        assert!(bag.get_string_map("environmentVariables").unwrap().is_empty());
    }
}
