//! Workspace map reconciliation.
//!
//! Brings the entries of a [`WorkspaceMap`] back in line with the local
//! scope after drift: a deleted or hand-edited `.bitmap`, a scope that lost
//! versions, or components the scope knows that the map forgot.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::bitmap::{WorkspaceEntry, WorkspaceMap};
use crate::errors::CoreError;
use crate::ledger::VersionLedger;
use crate::models::{ComponentId, Origin};
use crate::scope::{ComponentRecord, Scope};
use crate::writer::next_free_root;

/// What reconciliation did to one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum EntryChange {
    Unchanged { id: String },
    Added { entry: WorkspaceEntry },
    Updated { before: WorkspaceEntry, after: WorkspaceEntry },
}

impl EntryChange {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged { .. })
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub changes: Vec<EntryChange>,
    /// The scope moved since the map was last saved.
    pub stale: bool,
}

impl Reconciliation {
    pub fn mutations(&self) -> usize {
        self.changes.iter().filter(|c| !c.is_unchanged()).count()
    }
}

/// Latest tag the workspace should see for a component: the last exported
/// version, or the head when nothing was exported.
fn latest_tag(record: &ComponentRecord, ledger: &VersionLedger) -> Option<String> {
    record
        .exported_head
        .as_ref()
        .and_then(|id| ledger.get(id))
        .or_else(|| ledger.head_version())
        .map(|v| v.tag.clone())
}

/// Reconcile `map` against `scope`. Running it twice in a row without other
/// changes yields no mutations the second time.
pub fn reconcile(
    map: &mut WorkspaceMap,
    scope: &Scope,
    default_directory: &str,
) -> Result<Reconciliation, CoreError> {
    let fingerprint = scope.fingerprint()?;
    let stale = map.fingerprint().is_some_and(|fp| fp != fingerprint);
    if stale {
        warn!("workspace map is stale relative to the local scope");
    }

    let mut changes = Vec::new();
    let entries: Vec<WorkspaceEntry> = map.entries().cloned().collect();

    for before in entries {
        let full_name = before.full_name();
        let record = scope.get_component(&full_name)?;
        let ledger = scope.load_ledger(&full_name)?;

        let mut after = before.clone();
        match (&before.version, record.as_ref().zip(ledger.as_ref())) {
            // Resolvable versions stay, including local tags never exported.
            (Some(tag), Some((_, ledger))) if ledger.by_tag(tag).is_some() => {}
            (_, Some((record, ledger))) => {
                after.version = latest_tag(record, ledger);
            }
            // Unknown to the scope: the version cannot be right.
            (Some(_), None) => after.version = None,
            (None, None) => {}
        }

        if after == before {
            changes.push(EntryChange::Unchanged { id: before.id() });
        } else {
            debug!(
                component = %full_name,
                before = ?before.version,
                after = ?after.version,
                "reconciled entry"
            );
            map.upsert(after.clone());
            changes.push(EntryChange::Updated { before, after });
        }
    }

    let mut taken: BTreeSet<String> = map.roots().into_keys().collect();
    for record in scope.list_components()? {
        if map.get(&record.full_name).is_some() {
            continue;
        }
        let Some(ledger) = scope.load_ledger(&record.full_name)? else {
            continue;
        };
        let Some(tag) = latest_tag(&record, &ledger) else {
            continue;
        };
        let id = ComponentId::new(&record.scope, &record.name)?.with_version(&tag)?;
        let desired = format!("{}/{}", default_directory.trim_end_matches('/'), record.name);
        let root = next_free_root(&crate::fsutil::normalize_rel(&desired), &taken);
        taken.insert(root.clone());

        let entry = WorkspaceEntry::new(&id, &root, Origin::Imported);
        debug!(component = %record.full_name, root = %root, "adding entry known to the scope");
        map.upsert(entry.clone());
        changes.push(EntryChange::Added { entry });
    }

    map.set_fingerprint(&fingerprint);
    let result = Reconciliation { changes, stale };
    info!(
        entries = result.changes.len(),
        mutations = result.mutations(),
        stale,
        "reconciled workspace map"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Version;
    use crate::scope::{HeadUpdate, IngestBatch};

    fn tag(scope: &Scope, component: &str, tags: &[&str], exported: Option<usize>) -> Vec<Version> {
        let mut versions: Vec<Version> = Vec::new();
        for t in tags {
            let parents = versions.last().map(|p| vec![p.id.clone()]).unwrap_or_default();
            versions.push(Version::new(component, t, parents, "tree", ""));
        }
        scope
            .ingest(&IngestBatch {
                versions: versions.clone(),
                objects: vec![],
                heads: vec![HeadUpdate {
                    component: component.into(),
                    head: versions.last().map(|v| v.id.clone()),
                    exported_head: exported.map(|i| versions[i].id.clone()),
                }],
            })
            .unwrap();
        versions
    }

    fn entry(id: &str, root: &str) -> WorkspaceEntry {
        WorkspaceEntry::new(&ComponentId::parse(id).unwrap(), root, Origin::Authored)
    }

    #[test]
    fn test_missing_entry_is_added_at_exported_version() {
        let scope = Scope::in_memory("local").unwrap();
        tag(&scope, "remote/bar/foo", &["0.0.1", "0.0.2"], Some(0));
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");

        let result = reconcile(&mut map, &scope, "components").unwrap();
        assert_eq!(result.mutations(), 1);
        let e = map.get("remote/bar/foo").unwrap();
        assert_eq!(e.version.as_deref(), Some("0.0.1"));
        assert_eq!(e.root_dir, "components/bar/foo");
        assert_eq!(e.origin, Origin::Imported);
    }

    #[test]
    fn test_local_tag_newer_than_export_is_kept() {
        let scope = Scope::in_memory("local").unwrap();
        tag(&scope, "remote/comp", &["0.0.1", "0.0.2"], Some(0));
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        map.upsert(entry("remote/comp@0.0.2", "comp"));

        let result = reconcile(&mut map, &scope, "components").unwrap();
        assert_eq!(result.mutations(), 0);
        assert_eq!(map.get("remote/comp").unwrap().version.as_deref(), Some("0.0.2"));
    }

    #[test]
    fn test_unresolvable_version_falls_back_to_scope() {
        let scope = Scope::in_memory("local").unwrap();
        tag(&scope, "remote/comp", &["0.0.1"], Some(0));
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        map.upsert(entry("remote/comp@0.0.2", "comp"));

        reconcile(&mut map, &scope, "components").unwrap();
        assert_eq!(map.get("remote/comp").unwrap().version.as_deref(), Some("0.0.1"));
    }

    #[test]
    fn test_version_unknown_to_scope_is_dropped() {
        let scope = Scope::in_memory("local").unwrap();
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        map.upsert(entry("remote/bar/foo@0.0.1", "bar/foo"));

        let result = reconcile(&mut map, &scope, "components").unwrap();
        let EntryChange::Updated { before, after } = &result.changes[0] else {
            panic!("expected an update");
        };
        assert_eq!(before.id(), "remote/bar/foo@0.0.1");
        assert_eq!(after.id(), "remote/bar/foo");
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let scope = Scope::in_memory("local").unwrap();
        tag(&scope, "remote/a", &["0.0.1"], Some(0));
        tag(&scope, "remote/b", &["0.0.1", "0.0.2"], None);
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        map.upsert(entry("remote/c@0.0.3", "c"));

        let first = reconcile(&mut map, &scope, "components").unwrap();
        assert!(first.mutations() > 0);
        let snapshot = map.to_json();
        let second = reconcile(&mut map, &scope, "components").unwrap();
        assert_eq!(second.mutations(), 0);
        assert!(!second.stale);
        assert_eq!(map.to_json(), snapshot);
    }

    #[test]
    fn test_added_root_avoids_tracked_roots() {
        let scope = Scope::in_memory("local").unwrap();
        tag(&scope, "remote/foo", &["0.0.1"], Some(0));
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        map.upsert(entry("other/bar", "components/foo"));

        reconcile(&mut map, &scope, "components").unwrap();
        assert_eq!(map.get("remote/foo").unwrap().root_dir, "components/foo_1");
    }

    #[test]
    fn test_stale_when_scope_moved() {
        let scope = Scope::in_memory("local").unwrap();
        let mut map = WorkspaceMap::empty("/tmp/.bitmap");
        reconcile(&mut map, &scope, "components").unwrap();
        tag(&scope, "remote/a", &["0.0.1"], None);
        assert!(reconcile(&mut map, &scope, "components").unwrap().stale);
    }
}
