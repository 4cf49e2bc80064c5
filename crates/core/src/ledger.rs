//! Per-component version history.
//!
//! A [`VersionLedger`] is a directed acyclic graph of [`Version`]s linked by
//! explicit parent ids (one parent for a tag, two for a merge), plus a head
//! pointer. Ledgers fetched from a remote can be unioned with the local one so
//! the conflict detector sees both sides of a divergence in one graph.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{LedgerError, UserInputError};

/// Content-derived identifier of one version (SHA-256 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight bytes, for log lines. Ids that do not split cleanly there
    /// are returned whole.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry in a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    /// `scope/name` of the owning component.
    pub component: String,
    /// Semantic version string, unique within one scope's ledger.
    pub tag: String,
    /// One parent for a tag, two for a merge, none for a root.
    pub parents: Vec<VersionId>,
    /// Hash of the version's tree object.
    pub content_hash: String,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Version {
    /// Create a version with a fresh id.
    ///
    /// The id mixes in a random salt, so two workspaces tagging the same
    /// content with the same tag still produce distinct versions.
    pub fn new(
        component: &str,
        tag: &str,
        parents: Vec<VersionId>,
        content_hash: &str,
        message: &str,
    ) -> Self {
        let created_at = Utc::now();
        let mut hasher = Sha256::new();
        hasher.update(component.as_bytes());
        hasher.update([0]);
        hasher.update(tag.as_bytes());
        hasher.update([0]);
        for p in &parents {
            hasher.update(p.as_str().as_bytes());
            hasher.update([0]);
        }
        hasher.update(content_hash.as_bytes());
        hasher.update([0]);
        hasher.update(created_at.to_rfc3339().as_bytes());
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        Self {
            id: VersionId(hex::encode(hasher.finalize())),
            component: component.to_string(),
            tag: tag.to_string(),
            parents,
            content_hash: content_hash.to_string(),
            message: message.to_string(),
            created_at,
        }
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }
}

/// Ordered history of one component as recorded by one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionLedger {
    component: String,
    head: Option<VersionId>,
    versions: BTreeMap<VersionId, Version>,
}

impl VersionLedger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            head: None,
            versions: BTreeMap::new(),
        }
    }

    /// Rebuild a ledger from stored rows. Links are not checked here; use
    /// [`validate`](Self::validate) before trusting the graph.
    pub fn from_parts(
        component: impl Into<String>,
        head: Option<VersionId>,
        versions: impl IntoIterator<Item = Version>,
    ) -> Self {
        Self {
            component: component.into(),
            head,
            versions: versions.into_iter().map(|v| (v.id.clone(), v)).collect(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn head(&self) -> Option<&VersionId> {
        self.head.as_ref()
    }

    pub fn head_version(&self) -> Option<&Version> {
        self.head.as_ref().and_then(|h| self.versions.get(h))
    }

    pub fn set_head(&mut self, id: VersionId) -> Result<(), LedgerError> {
        if !self.versions.contains_key(&id) {
            return Err(LedgerError::VersionNotFound {
                component: self.component.clone(),
                version: id.to_string(),
            });
        }
        self.head = Some(id);
        Ok(())
    }

    pub fn get(&self, id: &VersionId) -> Option<&Version> {
        self.versions.get(id)
    }

    pub fn contains(&self, id: &VersionId) -> bool {
        self.versions.contains_key(id)
    }

    /// Find a version by tag. Two versions may share a tag once a merge brings
    /// in an independently tagged one; the version reachable from head wins.
    pub fn by_tag(&self, tag: &str) -> Option<&Version> {
        let mut matches = self.versions.values().filter(|v| v.tag == tag);
        let first = matches.next()?;
        let Some(second) = matches.next() else {
            return Some(first);
        };
        let reachable = self
            .head
            .as_ref()
            .and_then(|h| self.ancestors(h).ok())
            .unwrap_or_default();
        [first, second]
            .into_iter()
            .chain(matches)
            .find(|v| reachable.contains_key(&v.id))
            .or(Some(first))
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.versions.values()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Append a new version and move head to it.
    ///
    /// Every parent must already be in the ledger and the tag must be free.
    pub fn append(&mut self, version: Version) -> Result<(), UserInputError> {
        if self.versions.values().any(|v| v.tag == version.tag) {
            return Err(UserInputError::DuplicateTag {
                id: self.component.clone(),
                version: version.tag,
            });
        }
        debug!(component = %self.component, tag = %version.tag, id = version.id.short(), "appending version");
        self.head = Some(version.id.clone());
        self.versions.insert(version.id.clone(), version);
        Ok(())
    }

    /// Insert a version without moving head (used when unioning histories).
    pub fn insert(&mut self, version: Version) {
        self.versions.entry(version.id.clone()).or_insert(version);
    }

    /// Union another ledger's versions into this one. Head is unchanged.
    pub fn union(&mut self, other: &VersionLedger) {
        for v in other.versions.values() {
            self.insert(v.clone());
        }
    }

    /// Versions reachable from head, newest first.
    pub fn history(&self) -> Result<Vec<&Version>, LedgerError> {
        let Some(head) = &self.head else {
            return Ok(Vec::new());
        };
        let mut reachable: Vec<(&VersionId, usize)> = self.ancestors(head)?.into_iter().collect();
        reachable.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(reachable
            .into_iter()
            .filter_map(|(id, _)| self.versions.get(id))
            .collect())
    }

    /// Breadth-first ancestor set of `start` (inclusive) with the distance of
    /// each ancestor from `start`.
    ///
    /// Fails with [`LedgerError::InvalidLedger`] on a dangling parent link and
    /// with [`LedgerError::CyclicParents`] if the parent graph cycles.
    pub fn ancestors(&self, start: &VersionId) -> Result<HashMap<&VersionId, usize>, LedgerError> {
        self.check_acyclic(start)?;
        let start_key = self.key(start)?;
        let mut dist: HashMap<&VersionId, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        dist.insert(start_key, 0);
        queue.push_back(start_key);
        while let Some(id) = queue.pop_front() {
            let d = dist[id];
            for parent in &self.versions[id].parents {
                let parent_key = self.parent_key(id, parent)?;
                if !dist.contains_key(parent_key) {
                    dist.insert(parent_key, d + 1);
                    queue.push_back(parent_key);
                }
            }
        }
        Ok(dist)
    }

    /// Check every version reachable from head: parents exist, at most two of
    /// them, and no cycles.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if let Some(head) = &self.head {
            self.ancestors(head)?;
        }
        for v in self.versions.values() {
            if v.parents.len() > 2 {
                return Err(LedgerError::TooManyParents {
                    component: self.component.clone(),
                    version: v.tag.clone(),
                    count: v.parents.len(),
                });
            }
        }
        Ok(())
    }

    /// Iterative three-colour DFS over the graph reachable from `start`.
    fn check_acyclic(&self, start: &VersionId) -> Result<(), LedgerError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&VersionId, Mark> = HashMap::new();
        let mut stack: Vec<(&VersionId, usize)> = vec![(self.key(start)?, 0)];
        marks.insert(self.key(start)?, Mark::Visiting);

        while let Some((id, next_parent)) = stack.pop() {
            let parents = &self.versions[id].parents;
            if next_parent >= parents.len() {
                marks.insert(id, Mark::Done);
                continue;
            }
            stack.push((id, next_parent + 1));
            let parent = self.parent_key(id, &parents[next_parent])?;
            match marks.get(parent) {
                Some(Mark::Visiting) => {
                    return Err(LedgerError::CyclicParents {
                        component: self.component.clone(),
                        version: self.versions[parent].tag.clone(),
                    })
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(parent, Mark::Visiting);
                    stack.push((parent, 0));
                }
            }
        }
        Ok(())
    }

    fn key(&self, id: &VersionId) -> Result<&VersionId, LedgerError> {
        self.versions
            .get_key_value(id)
            .map(|(k, _)| k)
            .ok_or_else(|| LedgerError::VersionNotFound {
                component: self.component.clone(),
                version: id.to_string(),
            })
    }

    fn parent_key(&self, child: &VersionId, parent: &VersionId) -> Result<&VersionId, LedgerError> {
        self.versions
            .get_key_value(parent)
            .map(|(k, _)| k)
            .ok_or_else(|| LedgerError::InvalidLedger {
                component: self.component.clone(),
                version: self.versions[child].tag.clone(),
                parent: parent.to_string(),
            })
    }

    /// Versions reachable from `from` that are not reachable from `exclude`,
    /// oldest first. Used to pick what a push must transfer.
    pub fn versions_between(
        &self,
        from: &VersionId,
        exclude: Option<&VersionId>,
    ) -> Result<Vec<&Version>, LedgerError> {
        let keep = self.ancestors(from)?;
        let drop: HashSet<&VersionId> = match exclude.filter(|e| self.contains(e)) {
            Some(e) => self.ancestors(e)?.into_keys().collect(),
            None => HashSet::new(),
        };
        let mut out: Vec<(&VersionId, usize)> = keep
            .into_iter()
            .filter(|(id, _)| !drop.contains(id))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(out.into_iter().map(|(id, _)| &self.versions[id]).collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a version with a predictable id for graph tests.
    pub(crate) fn v(id: &str, tag: &str, parents: &[&str]) -> Version {
        Version {
            id: VersionId::new(id),
            component: "s/comp".into(),
            tag: tag.into(),
            parents: parents.iter().map(|p| VersionId::new(*p)).collect(),
            content_hash: format!("tree-{id}"),
            message: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_moves_head() {
        let mut ledger = VersionLedger::new("s/comp");
        ledger.append(v("a", "0.0.1", &[])).unwrap();
        ledger.append(v("b", "0.0.2", &["a"])).unwrap();
        assert_eq!(ledger.head().unwrap().as_str(), "b");
        assert_eq!(ledger.head_version().unwrap().tag, "0.0.2");
        let history: Vec<&str> = ledger.history().unwrap().iter().map(|v| v.tag.as_str()).collect();
        assert_eq!(history, vec!["0.0.2", "0.0.1"]);
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let mut ledger = VersionLedger::new("s/comp");
        ledger.append(v("a", "0.0.1", &[])).unwrap();
        let err = ledger.append(v("b", "0.0.1", &["a"])).unwrap_err();
        assert!(matches!(err, UserInputError::DuplicateTag { .. }));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(VersionId::new("0123456789abcdef").short(), "01234567");
        assert_eq!(VersionId::new("abc").short(), "abc");
        assert_eq!(VersionId::new("aéééé").short(), "aéééé");
    }

    #[test]
    fn test_new_versions_have_distinct_ids() {
        let a = Version::new("s/comp", "0.0.2", vec![], "tree", "");
        let b = Version::new("s/comp", "0.0.2", vec![], "tree", "");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_missing_parent_is_invalid() {
        let ledger = VersionLedger::from_parts(
            "s/comp",
            Some(VersionId::new("b")),
            vec![v("b", "0.0.2", &["ghost"])],
        );
        let err = ledger.validate().unwrap_err();
        assert!(matches!(err, LedgerError::InvalidLedger { .. }));
    }

    #[test]
    fn test_cycle_is_detected() {
        let ledger = VersionLedger::from_parts(
            "s/comp",
            Some(VersionId::new("c")),
            vec![
                v("a", "0.0.1", &["c"]),
                v("b", "0.0.2", &["a"]),
                v("c", "0.0.3", &["b"]),
            ],
        );
        let err = ledger.validate().unwrap_err();
        assert!(matches!(err, LedgerError::CyclicParents { .. }));
    }

    #[test]
    fn test_merge_version_ancestors() {
        let ledger = VersionLedger::from_parts(
            "s/comp",
            Some(VersionId::new("m")),
            vec![
                v("a", "0.0.1", &[]),
                v("b", "0.0.2", &["a"]),
                v("c", "0.0.3", &["a"]),
                v("m", "0.0.4", &["b", "c"]),
            ],
        );
        ledger.validate().unwrap();
        assert!(ledger.get(&VersionId::new("m")).unwrap().is_merge());
        let anc = ledger.ancestors(&VersionId::new("m")).unwrap();
        assert_eq!(anc.len(), 4);
        assert_eq!(anc[&VersionId::new("a")], 2);
    }

    #[test]
    fn test_versions_between() {
        let ledger = VersionLedger::from_parts(
            "s/comp",
            Some(VersionId::new("c")),
            vec![
                v("a", "0.0.1", &[]),
                v("b", "0.0.2", &["a"]),
                v("c", "0.0.3", &["b"]),
            ],
        );
        let tags: Vec<&str> = ledger
            .versions_between(&VersionId::new("c"), Some(&VersionId::new("a")))
            .unwrap()
            .iter()
            .map(|v| v.tag.as_str())
            .collect();
        assert_eq!(tags, vec!["0.0.2", "0.0.3"]);
    }

    #[test]
    fn test_by_tag_prefers_reachable_version() {
        let mut ledger = VersionLedger::from_parts(
            "s/comp",
            Some(VersionId::new("b1")),
            vec![v("a", "0.0.1", &[]), v("b1", "0.0.2", &["a"])],
        );
        ledger.insert(v("b0", "0.0.2", &["a"]));
        assert_eq!(ledger.by_tag("0.0.2").unwrap().id.as_str(), "b1");
    }
}
