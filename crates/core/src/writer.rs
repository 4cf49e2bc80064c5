//! Collision-safe persistence of many components at once.
//!
//! [`WriteCoordinator::plan`] settles every root directory of a batch before
//! anything touches the disk: a root that would contain another root of the
//! batch is moved aside to the lowest free `_N` suffix, and targets that are
//! plain files or foreign non-empty directories are rejected.
//! [`WriteCoordinator::persist`] then stages each component's files and
//! swaps the staged directories into place one component at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{CoreError, UserInputError, WriteError};
use crate::fsutil::{self, io_err, is_strict_prefix};
use crate::models::FileTree;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One component to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// `scope/name` of the component.
    pub id: String,
    /// Workspace-relative root the caller would like.
    pub desired_root: String,
    /// Complete file set of the component after the write.
    pub files: FileTree,
}

/// Batch-wide write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Replace non-empty directories that no component tracks.
    pub override_dir: bool,
}

/// A request with its final root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    pub id: String,
    pub root: String,
    /// Set when the desired root had to be moved aside.
    pub renamed_from: Option<String>,
    pub files: FileTree,
}

/// Settled roots for a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    pub writes: Vec<PlannedWrite>,
}

impl WritePlan {
    pub fn root_of(&self, id: &str) -> Option<&str> {
        self.writes
            .iter()
            .find(|w| w.id == id)
            .map(|w| w.root.as_str())
    }
}

/// Summary of a completed persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub components: usize,
    pub files: usize,
}

fn collides(a: &str, b: &str) -> bool {
    a == b || is_strict_prefix(a, b) || is_strict_prefix(b, a)
}

/// `desired` when it collides with nothing in `taken`, otherwise
/// `desired_N` for the lowest free `N >= 1`.
pub fn next_free_root(desired: &str, taken: &BTreeSet<String>) -> String {
    if taken.iter().all(|t| !collides(desired, t)) {
        return desired.to_string();
    }
    suffixed_root(desired, taken)
}

/// `desired_N` for the lowest `N >= 1` that collides with nothing in `taken`.
fn suffixed_root(desired: &str, taken: &BTreeSet<String>) -> String {
    (1..)
        .map(|n| format!("{desired}_{n}"))
        .find(|candidate| taken.iter().all(|t| !collides(candidate, t)))
        .unwrap_or_else(|| desired.to_string())
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Plans and persists one batch of component writes.
pub struct WriteCoordinator {
    workspace_root: PathBuf,
    staging_dir: PathBuf,
    /// Tracked root → owning component.
    tracked: BTreeMap<String, String>,
}

impl WriteCoordinator {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        tracked: BTreeMap<String, String>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            staging_dir: staging_dir.into(),
            tracked,
        }
    }

    fn abs(&self, rel: &str) -> PathBuf {
        fsutil::join_rel(&self.workspace_root, rel)
    }

    fn tracked_by(&self, root: &str, id: &str) -> bool {
        self.tracked.get(root).is_some_and(|owner| owner == id)
    }

    /// Settle the final root of every request and run the pre-checks. No
    /// disk writes happen here.
    pub fn plan(
        &self,
        requests: Vec<WriteRequest>,
        options: &WriteOptions,
    ) -> Result<WritePlan, CoreError> {
        let desired: Vec<String> = requests
            .iter()
            .map(|r| fsutil::normalize_rel(&r.desired_root))
            .collect();

        let mut taken: BTreeSet<String> = self.tracked.keys().cloned().collect();
        taken.extend(desired.iter().cloned());

        let mut writes = Vec::with_capacity(requests.len());
        let mut assigned: Vec<String> = Vec::with_capacity(requests.len());

        for (idx, request) in requests.into_iter().enumerate() {
            let root = desired[idx].clone();

            if self.tracked_by(&root, &request.id) {
                debug!(component = %request.id, root = %root, "writing over own tracked root");
                assigned.push(root.clone());
                writes.push(PlannedWrite {
                    id: request.id,
                    root,
                    renamed_from: None,
                    files: request.files,
                });
                continue;
            }

            let foreign_tracked = self
                .tracked
                .iter()
                .filter(|(_, owner)| **owner != request.id);
            let mut must_rename = false;
            for (tracked_root, owner) in foreign_tracked {
                if is_strict_prefix(tracked_root, &root) {
                    return Err(UserInputError::NestedRoot {
                        root,
                        parent: tracked_root.clone(),
                        owner: owner.clone(),
                    }
                    .into());
                }
                if *tracked_root == root || is_strict_prefix(&root, tracked_root) {
                    must_rename = true;
                }
            }
            let parent_of_batch_root = desired
                .iter()
                .enumerate()
                .any(|(j, other)| j != idx && is_strict_prefix(&root, other));
            let duplicate_in_batch = desired[..idx].contains(&root) || assigned.contains(&root);
            must_rename |= parent_of_batch_root || duplicate_in_batch;

            let (root, renamed_from) = if must_rename {
                let mut blocked = taken.clone();
                blocked.extend(assigned.iter().cloned());
                let renamed = suffixed_root(&root, &blocked);
                info!(component = %request.id, from = %root, to = %renamed, "renaming colliding root");
                taken.insert(renamed.clone());
                (renamed, Some(root))
            } else {
                (root, None)
            };

            self.precheck(&request.id, &root, options)?;
            assigned.push(root.clone());
            writes.push(PlannedWrite {
                id: request.id,
                root,
                renamed_from,
                files: request.files,
            });
        }

        debug!(components = writes.len(), "write plan settled");
        Ok(WritePlan { writes })
    }

    fn precheck(&self, id: &str, root: &str, options: &WriteOptions) -> Result<(), CoreError> {
        let target = self.abs(root);
        if target.is_file() {
            return Err(UserInputError::TargetIsFile(target).into());
        }
        if !options.override_dir && !self.tracked_by(root, id) && fsutil::dir_has_entries(&target)? {
            return Err(UserInputError::DirectoryNotEmpty(target).into());
        }
        Ok(())
    }

    /// Stage every component, then flush them one by one.
    ///
    /// A component either lands completely or not at all: if its flush fails
    /// its previous directory is put back and [`WriteError::PartialFlush`]
    /// names the components that were already flushed. Those stay on disk.
    pub fn persist(&self, plan: &WritePlan) -> Result<WriteReport, WriteError> {
        let batch_dir = self.staging_dir.join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&batch_dir).map_err(io_err(&batch_dir))?;

        let result = self.stage(plan, &batch_dir).and_then(|()| self.flush(plan, &batch_dir));
        if let Err(e) = fs::remove_dir_all(&batch_dir) {
            warn!(path = %batch_dir.display(), error = %e, "failed to clean up staging directory");
        }
        result
    }

    fn stage(&self, plan: &WritePlan, batch_dir: &Path) -> Result<(), WriteError> {
        for (idx, write) in plan.writes.iter().enumerate() {
            let dir = batch_dir.join(idx.to_string());
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
            for (rel, content) in &write.files {
                let path = fsutil::join_rel(&dir, rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(io_err(parent))?;
                }
                fs::write(&path, content).map_err(io_err(&path))?;
            }
            debug!(component = %write.id, files = write.files.len(), "staged component");
        }
        Ok(())
    }

    fn flush(&self, plan: &WritePlan, batch_dir: &Path) -> Result<WriteReport, WriteError> {
        let mut flushed: Vec<String> = Vec::new();
        let mut report = WriteReport::default();

        for (idx, write) in plan.writes.iter().enumerate() {
            let staged = batch_dir.join(idx.to_string());
            let backup = batch_dir.join(format!("backup-{idx}"));
            let target = self.abs(&write.root);

            if let Err(e) = swap_in(&staged, &target, &backup) {
                warn!(component = %write.id, error = %e, "flush failed, component rolled back");
                return Err(WriteError::PartialFlush {
                    component: write.id.clone(),
                    detail: e.to_string(),
                    flushed,
                });
            }
            flushed.push(write.id.clone());
            report.components += 1;
            report.files += write.files.len();
        }

        info!(components = report.components, files = report.files, "flushed write batch");
        Ok(report)
    }
}

/// Move `target` (if any) to `backup`, then `staged` to `target`. On failure
/// the backup is moved back.
fn swap_in(staged: &Path, target: &Path, backup: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let had_previous = target.exists();
    if had_previous {
        fs::rename(target, backup)?;
    }
    if let Err(e) = fs::rename(staged, target) {
        if had_previous {
            fs::rename(backup, target)?;
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, root: &str) -> WriteRequest {
        let mut files = FileTree::new();
        files.insert("index.js".into(), format!("// {id}\n").into_bytes());
        WriteRequest {
            id: id.into(),
            desired_root: root.into(),
            files,
        }
    }

    fn coordinator(root: &Path, tracked: &[(&str, &str)]) -> WriteCoordinator {
        WriteCoordinator::new(
            root,
            root.join(".scope/staging"),
            tracked
                .iter()
                .map(|(r, o)| (r.to_string(), o.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_parent_root_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), &[]);
        let plan = c
            .plan(vec![request("s/bar", "bar"), request("s/bar/foo", "bar/foo")], &WriteOptions::default())
            .unwrap();
        assert_eq!(plan.root_of("s/bar"), Some("bar_1"));
        assert_eq!(plan.root_of("s/bar/foo"), Some("bar/foo"));
        assert_eq!(plan.writes[0].renamed_from.as_deref(), Some("bar"));
    }

    #[test]
    fn test_rename_skips_taken_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), &[("bar_1", "s/old")]);
        let plan = c
            .plan(vec![request("s/bar", "bar"), request("s/bar/foo", "bar/foo")], &WriteOptions::default())
            .unwrap();
        assert_eq!(plan.root_of("s/bar"), Some("bar_2"));
    }

    #[test]
    fn test_own_tracked_root_is_never_renamed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bar")).unwrap();
        std::fs::write(dir.path().join("bar/index.js"), "old").unwrap();
        let c = coordinator(dir.path(), &[("bar", "s/bar")]);
        let plan = c
            .plan(vec![request("s/bar", "bar"), request("s/baz", "bar-baz")], &WriteOptions::default())
            .unwrap();
        assert_eq!(plan.root_of("s/bar"), Some("bar"));
    }

    #[test]
    fn test_duplicate_roots_in_batch() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), &[]);
        let plan = c
            .plan(vec![request("a/utils", "utils"), request("b/utils", "utils")], &WriteOptions::default())
            .unwrap();
        assert_eq!(plan.root_of("a/utils"), Some("utils"));
        assert_eq!(plan.root_of("b/utils"), Some("utils_1"));
    }

    #[test]
    fn test_root_inside_foreign_tracked_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), &[("bar", "s/bar")]);
        let err = c
            .plan(vec![request("s/foo", "bar/foo")], &WriteOptions::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::UserInput(UserInputError::NestedRoot { .. })));
    }

    #[test]
    fn test_prechecks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join("busy")).unwrap();
        std::fs::write(dir.path().join("busy/other.txt"), "x").unwrap();
        let c = coordinator(dir.path(), &[]);

        let err = c.plan(vec![request("s/a", "file")], &WriteOptions::default()).unwrap_err();
        assert!(matches!(err, CoreError::UserInput(UserInputError::TargetIsFile(_))));

        let err = c.plan(vec![request("s/a", "busy")], &WriteOptions::default()).unwrap_err();
        assert!(matches!(err, CoreError::UserInput(UserInputError::DirectoryNotEmpty(_))));

        let err = c
            .plan(vec![request("s/a", "file")], &WriteOptions { override_dir: true })
            .unwrap_err();
        assert!(matches!(err, CoreError::UserInput(UserInputError::TargetIsFile(_))));

        c.plan(vec![request("s/a", "busy")], &WriteOptions { override_dir: true })
            .unwrap();
    }

    #[test]
    fn test_persist_replaces_directory_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("comp")).unwrap();
        std::fs::write(dir.path().join("comp/stale.js"), "old").unwrap();
        let c = coordinator(dir.path(), &[("comp", "s/comp")]);

        let mut req = request("s/comp", "comp");
        req.files.insert("lib/util.js".into(), b"util".to_vec());
        let plan = c.plan(vec![req], &WriteOptions::default()).unwrap();
        let report = c.persist(&plan).unwrap();

        assert_eq!(report.components, 1);
        assert_eq!(report.files, 2);
        assert!(!dir.path().join("comp/stale.js").exists());
        assert_eq!(std::fs::read(dir.path().join("comp/lib/util.js")).unwrap(), b"util");
        let leftovers = std::fs::read_dir(dir.path().join(".scope/staging")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_failed_flush_reports_flushed_components() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocker"), "plain file").unwrap();
        let c = coordinator(dir.path(), &[]);
        let plan = c
            .plan(vec![request("s/ok", "ok"), request("s/stuck", "blocker/stuck")], &WriteOptions::default())
            .unwrap();

        let err = c.persist(&plan).unwrap_err();
        let WriteError::PartialFlush { component, flushed, .. } = err else {
            panic!("expected a partial flush");
        };
        assert_eq!(component, "s/stuck");
        assert_eq!(flushed, vec!["s/ok".to_string()]);
        assert!(dir.path().join("ok/index.js").exists());
        assert!(!dir.path().join("blocker/stuck").exists());
    }

    #[test]
    fn test_next_free_root() {
        let taken: BTreeSet<String> = ["components/foo".to_string()].into();
        assert_eq!(next_free_root("components/bar", &taken), "components/bar");
        assert_eq!(next_free_root("components/foo", &taken), "components/foo_1");
        assert_eq!(next_free_root("components", &taken), "components_1");
    }
}
