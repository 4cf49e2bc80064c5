//! The persisted workspace map (`.bitmap`).
//!
//! A JSON object keyed by component id. Each value records the checked-out
//! version, the root directory, the origin and optional config overrides.
//! Keys stay as short as the set of entries allows: the bare name while it
//! is unique, `name@version` or `scope/name@version` only while needed to
//! tell entries apart. Keys starting with `$` hold workspace metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::SyncError;
use crate::fsutil;
use crate::ledger::VersionId;
use crate::models::{split_version, ComponentId, Origin};

/// File name of the workspace map in the workspace root.
pub const BITMAP_FILE: &str = ".bitmap";

/// Metadata key holding the scope fingerprint seen at the last save.
pub const FINGERPRINT_KEY: &str = "$scope-fingerprint";

const SCHEMA_KEY: &str = "$schema-version";
const SCHEMA_VERSION: &str = "1";

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One tracked component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceEntry {
    pub scope: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Workspace-relative root directory, `/`-separated.
    pub root_dir: String,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
    /// Local head to record as second parent on the next tag, left behind
    /// by a merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_parent: Option<VersionId>,
}

impl WorkspaceEntry {
    pub fn new(id: &ComponentId, root_dir: &str, origin: Origin) -> Self {
        Self {
            scope: id.scope().to_string(),
            name: id.name().to_string(),
            version: id.version().map(str::to_string),
            root_dir: fsutil::normalize_rel(root_dir),
            origin,
            config: None,
            merge_parent: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }

    /// The entry's id, pinned to its version when it has one.
    pub fn id(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}", self.full_name(), v),
            None => self.full_name(),
        }
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// In-memory workspace map. Loaded once per operation, mutated in memory and
/// saved once at the end.
#[derive(Debug, Clone)]
pub struct WorkspaceMap {
    path: PathBuf,
    entries: BTreeMap<String, WorkspaceEntry>,
    fingerprint: Option<String>,
    dirty: bool,
}

impl WorkspaceMap {
    /// An empty map that will be saved to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            fingerprint: None,
            dirty: true,
        }
    }

    /// Load the map at `path`. A missing file is an empty map.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "no workspace map yet");
            return Ok(Self::empty(path));
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| SyncError::WorkspaceMap {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        let mut map = Self::from_json(&raw).map_err(|detail| SyncError::WorkspaceMap {
            path: path.clone(),
            detail,
        })?;
        map.path = path;
        debug!(path = %map.path.display(), entries = map.entries.len(), "loaded workspace map");
        Ok(map)
    }

    /// Write the map if anything changed since it was loaded.
    pub fn save(&mut self) -> Result<bool, SyncError> {
        if !self.dirty {
            debug!("workspace map unchanged, not saving");
            return Ok(false);
        }
        let json = self.to_json();
        fsutil::atomic_write(&self.path, json.as_bytes()).map_err(|e| SyncError::WorkspaceMap {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        self.dirty = false;
        info!(path = %self.path.display(), entries = self.entries.len(), "saved workspace map");
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &WorkspaceEntry> {
        self.entries.values()
    }

    pub fn get(&self, full_name: &str) -> Option<&WorkspaceEntry> {
        self.entries.get(full_name)
    }

    /// Insert or replace an entry, keyed by its `scope/name`.
    pub fn upsert(&mut self, entry: WorkspaceEntry) {
        let key = entry.full_name();
        if self.entries.get(&key) != Some(&entry) {
            self.entries.insert(key, entry);
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, full_name: &str) -> Option<WorkspaceEntry> {
        let removed = self.entries.remove(full_name);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Root directory → owning component, for every tracked entry.
    pub fn roots(&self) -> BTreeMap<String, String> {
        self.entries
            .values()
            .map(|e| (e.root_dir.clone(), e.full_name()))
            .collect()
    }

    /// Find a tracked entry by a user-supplied id: `scope/name`, a bare name,
    /// or either with an `@version` suffix.
    pub fn find(&self, id: &str) -> Option<&WorkspaceEntry> {
        let (base, _) = split_version(id);
        if let Some(entry) = self.entries.get(base) {
            return Some(entry);
        }
        let mut by_name = self.entries.values().filter(|e| e.name == base);
        match (by_name.next(), by_name.next()) {
            (Some(entry), None) => Some(entry),
            _ => None,
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn set_fingerprint(&mut self, fingerprint: &str) {
        if self.fingerprint.as_deref() != Some(fingerprint) {
            self.fingerprint = Some(fingerprint.to_string());
            self.dirty = true;
        }
    }

    // -- serialization ------------------------------------------------------

    /// Key each entry is written under.
    fn keys(&self) -> BTreeMap<String, String> {
        let mut name_count: BTreeMap<&str, usize> = BTreeMap::new();
        let mut pinned_count: BTreeMap<String, usize> = BTreeMap::new();
        for e in self.entries.values() {
            *name_count.entry(e.name.as_str()).or_default() += 1;
            if let Some(v) = &e.version {
                *pinned_count.entry(format!("{}@{}", e.name, v)).or_default() += 1;
            }
        }
        // A bare name must also not read like another entry's scope/name.
        let full_names: BTreeSet<String> = self.entries.keys().cloned().collect();

        self.entries
            .iter()
            .map(|(full_name, e)| {
                let key = if name_count[e.name.as_str()] == 1
                    && (!full_names.contains(&e.name) || e.name == *full_name)
                {
                    e.name.clone()
                } else {
                    match &e.version {
                        Some(v) if pinned_count[&format!("{}@{}", e.name, v)] == 1 => {
                            format!("{}@{}", e.name, v)
                        }
                        _ => e.id(),
                    }
                };
                (full_name.clone(), key)
            })
            .collect()
    }

    pub fn to_json(&self) -> String {
        let mut root = Map::new();
        root.insert(SCHEMA_KEY.into(), Value::String(SCHEMA_VERSION.into()));
        if let Some(fp) = &self.fingerprint {
            root.insert(FINGERPRINT_KEY.into(), Value::String(fp.clone()));
        }
        let keys = self.keys();
        for (full_name, entry) in &self.entries {
            let value = serde_json::to_value(entry).unwrap_or(Value::Null);
            root.insert(keys[full_name].clone(), value);
        }
        let mut out = serde_json::to_string_pretty(&Value::Object(root)).unwrap_or_default();
        out.push('\n');
        out
    }

    /// Parse the JSON form. The map path is left empty.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let root: Map<String, Value> = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let mut entries = BTreeMap::new();
        let mut fingerprint = None;
        for (key, value) in root {
            if key.starts_with('$') {
                if key == FINGERPRINT_KEY {
                    fingerprint = value.as_str().map(str::to_string);
                }
                continue;
            }
            let mut entry: WorkspaceEntry =
                serde_json::from_value(value).map_err(|e| format!("entry '{key}': {e}"))?;
            // A version carried only in the key still counts.
            if entry.version.is_none() {
                entry.version = split_version(&key).1.map(str::to_string);
            }
            entry.root_dir = fsutil::normalize_rel(&entry.root_dir);
            let full_name = entry.full_name();
            if entries.insert(full_name.clone(), entry).is_some() {
                return Err(format!("component '{full_name}' is listed twice"));
            }
        }
        Ok(Self {
            path: PathBuf::new(),
            entries,
            fingerprint,
            dirty: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, root: &str) -> WorkspaceEntry {
        WorkspaceEntry::new(&ComponentId::parse(id).unwrap(), root, Origin::Authored)
    }

    #[test]
    fn test_keys_use_shortest_unambiguous_form() {
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        map.upsert(entry("remote/bar/foo@0.0.1", "components/bar/foo"));
        map.upsert(entry("remote/utils@0.0.1", "components/utils"));
        map.upsert(entry("other/utils@0.0.2", "components/other-utils"));
        map.upsert(entry("third/utils@0.0.2", "components/third-utils"));

        let keys = map.keys();
        assert_eq!(keys["remote/bar/foo"], "bar/foo");
        assert_eq!(keys["remote/utils"], "utils@0.0.1");
        assert_eq!(keys["other/utils"], "other/utils@0.0.2");
        assert_eq!(keys["third/utils"], "third/utils@0.0.2");
    }

    #[test]
    fn test_json_round_trip_preserves_entries() {
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        let mut e = entry("remote/bar/foo@0.0.2", "components/bar/foo");
        e.origin = Origin::Imported;
        e.merge_parent = Some(VersionId::new("abc"));
        map.upsert(e.clone());
        map.set_fingerprint("f00");

        let json = map.to_json();
        assert!(json.contains("\"rootDir\": \"components/bar/foo\""));
        assert!(json.contains("\"$scope-fingerprint\": \"f00\""));

        let back = WorkspaceMap::from_json(&json).unwrap();
        assert_eq!(back.get("remote/bar/foo"), Some(&e));
        assert_eq!(back.fingerprint(), Some("f00"));
        assert!(!back.is_dirty());
    }

    #[test]
    fn test_version_in_key_is_read_back() {
        let raw = r#"{
            "bar/foo@0.0.1": { "scope": "remote", "name": "bar/foo", "rootDir": "./bar/foo/" }
        }"#;
        let map = WorkspaceMap::from_json(raw).unwrap();
        let e = map.get("remote/bar/foo").unwrap();
        assert_eq!(e.version.as_deref(), Some("0.0.1"));
        assert_eq!(e.root_dir, "bar/foo");
        assert_eq!(e.origin, Origin::Authored);
    }

    #[test]
    fn test_find_by_name_or_full_name() {
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        map.upsert(entry("remote/bar/foo", "bar/foo"));
        assert!(map.find("remote/bar/foo").is_some());
        assert!(map.find("bar/foo@0.0.1").is_some());
        assert!(map.find("baz").is_none());
    }

    #[test]
    fn test_save_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BITMAP_FILE);
        let mut map = WorkspaceMap::load(&path).unwrap();
        map.upsert(entry("remote/comp1", "comp1"));
        assert!(map.save().unwrap());
        assert!(!map.save().unwrap());

        let mut reloaded = WorkspaceMap::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        reloaded.upsert(entry("remote/comp1", "comp1"));
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn test_malformed_file_is_a_sync_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BITMAP_FILE);
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(WorkspaceMap::load(&path), Err(SyncError::WorkspaceMap { .. })));
    }
}
