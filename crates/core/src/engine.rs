//! Workspace operations.
//!
//! The [`Engine`] is bound to one workspace root and drives every command:
//!
//! 1. Load the workspace map once.
//! 2. Classify each target component against the relevant ledger.
//! 3. Route divergence through the merge engine when asked to.
//! 4. Hand all resulting files to one write coordinator batch.
//! 5. Record new versions in the local scope, then save the map once.
//!
//! Nothing touches the disk before step 4, so a failed classification leaves
//! the workspace exactly as it was.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::WorkspaceConfig;
use crate::conflict::{
    ComponentMerge, ConflictDetector, MergeEngine, MergeLabels, MergeStrategy, Relation, Side,
};
use crate::errors::{
    ConflictError, CoreError, DatabaseError, LedgerError, MergeConflict, RemoteConflict,
    SyncError, UserInputError,
};
use crate::fsutil;
use crate::ledger::{Version, VersionId, VersionLedger};
use crate::models::{ComponentId, ComponentStatus, FileTree, Origin, SemVer};
use crate::remote::{ObjectPayload, PushComponent, PushRequest, RemoteActionDispatcher};
use crate::scope::{self, queries, HeadUpdate, IngestBatch, RemoteRecord, Scope};
use crate::workspace::{reconcile, EntryChange, WorkspaceEntry, WorkspaceMap, WorkspacePaths};
use crate::writer::{WriteCoordinator, WriteOptions, WritePlan, WriteRequest};

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagOptions {
    /// Components to tag; every tracked component when empty.
    pub ids: Vec<String>,
    /// Explicit version; the next patch after the highest known tag otherwise.
    pub version: Option<String>,
    /// Tag components whose content did not change.
    pub unmodified: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Components to export; every staged component when empty.
    pub ids: Vec<String>,
    /// Name of the remote to export to.
    pub remote: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Components to import; every tracked component when empty.
    pub ids: Vec<String>,
    /// Name of the remote to import from.
    pub remote: String,
    /// Merge diverged or locally modified components with this strategy.
    pub merge: Option<MergeStrategy>,
    /// Target directory, only with a single component.
    pub path: Option<String>,
    /// Replace non-empty untracked directories.
    pub override_dir: bool,
    /// Merge histories that share no common ancestor.
    pub allow_unrelated: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    /// `id@version` of every component the remote accepted.
    pub exported: Vec<String>,
    pub up_to_date: Vec<String>,
}

/// One component written by an import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportedComponent {
    pub id: String,
    pub version: String,
    pub root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MergeStrategy>,
    pub conflicted_files: Vec<String>,
    pub modified: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: Vec<ImportedComponent>,
    pub up_to_date: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub components: Vec<ComponentStatus>,
    /// What reconciliation did to the workspace map.
    pub changes: Vec<EntryChange>,
    /// The local scope moved since the map was last saved.
    pub stale: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Operations on one workspace.
pub struct Engine {
    paths: WorkspacePaths,
    config: WorkspaceConfig,
    scope: Scope,
}

impl Engine {
    /// Create a workspace at `root`: configuration, an empty `.bitmap` and
    /// the local scope. Re-running it keeps the map and the scope.
    pub fn init(root: impl Into<PathBuf>, config: WorkspaceConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let paths = WorkspacePaths::new(root);
        std::fs::create_dir_all(&paths.root).map_err(fsutil::io_err(&paths.root))?;

        fsutil::atomic_write(&paths.config(), config.to_toml()?.as_bytes())?;
        WorkspaceMap::load(paths.bitmap())?.save()?;
        let scope = Scope::init(paths.local_scope(), &config.workspace.default_scope)?;

        info!(
            root = %paths.root.display(),
            scope = %config.workspace.default_scope,
            "initialized workspace"
        );
        Ok(Self {
            paths,
            config,
            scope,
        })
    }

    /// Open an existing workspace.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let paths = WorkspacePaths::new(root);
        let config = WorkspaceConfig::load(paths.config())?;
        let scope = Scope::open(paths.local_scope())?;
        debug!(root = %paths.root.display(), "opened workspace");
        Ok(Self {
            paths,
            config,
            scope,
        })
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The strategy named by `raw`, or the configured default.
    pub fn merge_strategy(&self, raw: Option<&str>) -> Result<MergeStrategy, UserInputError> {
        match raw {
            Some(name) => name.parse(),
            None => Ok(self.config.merge.default_strategy),
        }
    }

    // -----------------------------------------------------------------------
    // add / remove
    // -----------------------------------------------------------------------

    /// Start tracking `dir` as the authored component `name` of the default
    /// scope.
    pub fn add(&self, name: &str, dir: &Path) -> Result<WorkspaceEntry, CoreError> {
        let id = ComponentId::new(&self.config.workspace.default_scope, name)?;
        let abs = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.paths.root.join(dir)
        };
        if dir.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(UserInputError::OutsideWorkspace(abs).into());
        }
        if abs.is_file() {
            return Err(UserInputError::TargetIsFile(abs).into());
        }
        if !abs.is_dir() {
            return Err(UserInputError::DirectoryNotFound(abs).into());
        }
        let rel = self
            .paths
            .relativize(&abs)
            .ok_or_else(|| UserInputError::OutsideWorkspace(abs.clone()))?;

        let mut map = self.load_map()?;
        if map.get(&id.full_name()).is_some() {
            return Err(UserInputError::AlreadyTracked(id.full_name()).into());
        }
        for (root, owner) in map.roots() {
            if root == rel || fsutil::is_strict_prefix(&root, &rel) || fsutil::is_strict_prefix(&rel, &root) {
                return Err(UserInputError::NestedRoot {
                    root: rel,
                    parent: root,
                    owner,
                }
                .into());
            }
        }

        let mut entry = WorkspaceEntry::new(&id, &rel, Origin::Authored);
        if let Some(ledger) = self.scope.load_ledger(&id.full_name())? {
            entry.version = ledger.head_version().map(|v| v.tag.clone());
        }
        map.upsert(entry.clone());
        self.finish(&mut map)?;
        info!(component = %id, root = %entry.root_dir, "tracking component");
        Ok(entry)
    }

    /// Stop tracking components. Their files stay on disk; their local
    /// history is dropped so reconciliation does not bring them back.
    pub fn remove(&self, ids: &[String]) -> Result<Vec<String>, CoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut map = self.load_map()?;
        let targets = self
            .tracked_targets(&map, ids)?
            .iter()
            .map(WorkspaceEntry::full_name)
            .collect::<Vec<_>>();
        for full_name in &targets {
            map.remove(full_name);
            self.scope.remove_component(full_name)?;
            info!(component = %full_name, "stopped tracking component");
        }
        self.finish(&mut map)?;
        Ok(targets)
    }

    // -----------------------------------------------------------------------
    // tag
    // -----------------------------------------------------------------------

    /// Snapshot components into the local scope.
    ///
    /// All targets are checked before anything is stored, and the snapshots
    /// land in one transaction.
    pub fn tag(&self, options: &TagOptions) -> Result<Vec<ComponentId>, CoreError> {
        if let Some(version) = &options.version {
            SemVer::parse(version)?;
        }
        let mut map = self.load_map()?;
        let targets = self.tracked_targets(&map, &options.ids)?;

        let mut pending: Vec<(WorkspaceEntry, FileTree, Version)> = Vec::new();
        for entry in targets {
            let full_name = entry.full_name();
            let tree = self.entry_tree(&entry)?;
            let content_hash = scope::tree_hash(&tree);
            let ledger = self
                .scope
                .load_ledger(&full_name)?
                .unwrap_or_else(|| VersionLedger::new(full_name.as_str()));
            ledger.validate()?;

            let changed = ledger
                .head_version()
                .map_or(true, |head| head.content_hash != content_hash);
            if !changed && !options.unmodified && entry.merge_parent.is_none() {
                debug!(component = %full_name, "unchanged, not tagging");
                continue;
            }

            let tag = match &options.version {
                Some(version) => version.clone(),
                None => next_tag(&ledger),
            };
            if ledger.versions().any(|v| v.tag == tag) {
                return Err(UserInputError::DuplicateTag {
                    id: full_name,
                    version: tag,
                }
                .into());
            }

            let mut parents: Vec<VersionId> = ledger.head().cloned().into_iter().collect();
            if let Some(second) = entry
                .merge_parent
                .as_ref()
                .filter(|p| ledger.contains(p) && Some(*p) != ledger.head())
            {
                parents.push(second.clone());
            }
            let version = Version::new(&full_name, &tag, parents, &content_hash, &options.message);
            pending.push((entry, tree, version));
        }

        self.scope.transaction(|conn| {
            for (_, tree, version) in &pending {
                queries::put_tree(conn, tree)?;
                queries::insert_version(conn, version)?;
                queries::set_head(conn, &version.component, &version.id)?;
            }
            Ok(())
        })?;

        let mut tagged = Vec::with_capacity(pending.len());
        for (mut entry, tree, version) in pending {
            info!(
                component = %version.component,
                tag = %version.tag,
                files = tree.len(),
                merge = version.is_merge(),
                "tagged component"
            );
            tagged.push(ComponentId::parse(&version.component)?.with_version(&version.tag)?);
            entry.version = Some(version.tag);
            entry.merge_parent = None;
            map.upsert(entry);
        }
        self.finish(&mut map)?;
        Ok(tagged)
    }

    // -----------------------------------------------------------------------
    // export
    // -----------------------------------------------------------------------

    /// Push local versions to a remote.
    ///
    /// The first round trip fetches the remote ledgers and classifies every
    /// component; any divergence aborts the whole batch with one
    /// [`ConflictError::MergeConflictOnRemote`]. The second round trip pushes,
    /// and the remote checks again before applying anything.
    pub fn export(&self, options: &ExportOptions) -> Result<ExportReport, CoreError> {
        let map = self.load_map()?;
        let ids = self.export_targets(&map, &options.ids)?;
        let mut report = ExportReport::default();
        if ids.is_empty() {
            info!("nothing to export");
            return Ok(report);
        }

        let dispatcher = RemoteActionDispatcher::new(&self.scope);
        let remote_ledgers = dispatcher.fetch_ledgers(&options.remote, &ids)?;

        let mut conflicts = Vec::new();
        let mut new_on_remote = Vec::new();
        let mut components = Vec::new();
        let mut trees = BTreeSet::new();
        let mut exported_heads: Vec<(String, VersionId)> = Vec::new();
        let mut pushed: Vec<String> = Vec::new();

        for full_name in &ids {
            let local = self
                .scope
                .load_ledger(full_name)?
                .ok_or_else(|| UserInputError::ComponentNotFound(full_name.clone()))?;
            let head = local
                .head_version()
                .cloned()
                .ok_or_else(|| UserInputError::NotTagged(full_name.clone()))?;
            let remote = remote_ledgers.get(full_name);
            let remote_head = remote.and_then(VersionLedger::head).cloned();

            let mut graph = local.clone();
            if let Some(remote) = remote {
                graph.union(remote);
            }
            let relation = match &remote_head {
                None => Relation::FastForward(Side::Local),
                Some(remote_head) => ConflictDetector::detect(&graph, &head.id, remote_head)?,
            };

            match relation {
                Relation::UpToDate => {
                    report.up_to_date.push(full_name.clone());
                    exported_heads.push((full_name.clone(), head.id.clone()));
                }
                Relation::FastForward(Side::Remote) => {
                    warn!(component = %full_name, "remote is ahead, nothing to export");
                    report.up_to_date.push(full_name.clone());
                    exported_heads.push((full_name.clone(), head.id.clone()));
                }
                Relation::FastForward(Side::Local) => {
                    let versions: Vec<Version> = local
                        .versions_between(&head.id, remote_head.as_ref())?
                        .into_iter()
                        .cloned()
                        .collect();
                    trees.extend(versions.iter().map(|v| v.content_hash.clone()));
                    debug!(component = %full_name, versions = versions.len(), "will push");
                    components.push(PushComponent {
                        id: full_name.clone(),
                        head: head.id.clone(),
                        versions,
                    });
                    exported_heads.push((full_name.clone(), head.id.clone()));
                    pushed.push(format!("{full_name}@{}", head.tag));
                }
                Relation::Conflict(divergence) => conflicts.push(RemoteConflict {
                    id: full_name.clone(),
                    versions: tags_of(&graph, &divergence.local_only),
                }),
                Relation::Unrelated => new_on_remote.push(full_name.clone()),
            }
        }

        if !conflicts.is_empty() || !new_on_remote.is_empty() {
            warn!(
                conflicts = conflicts.len(),
                new_on_remote = new_on_remote.len(),
                "export aborted"
            );
            return Err(ConflictError::MergeConflictOnRemote {
                conflicts,
                new_on_remote,
            }
            .into());
        }

        if !components.is_empty() {
            let mut objects = BTreeMap::new();
            for tree in &trees {
                for (hash, content) in self.scope.tree_objects(tree)? {
                    objects.entry(hash).or_insert(content);
                }
            }
            let request = PushRequest {
                components,
                objects: objects
                    .iter()
                    .map(|(hash, content)| ObjectPayload::encode(hash, content))
                    .collect(),
            };
            let outcome = dispatcher.push(&options.remote, &request)?;
            if !outcome.is_applied() {
                warn!("remote rejected the push");
                return Err(ConflictError::MergeConflictOnRemote {
                    conflicts: outcome.rejected,
                    new_on_remote: outcome.new_on_remote,
                }
                .into());
            }
        }

        self.scope.transaction(|conn| {
            for (full_name, head) in &exported_heads {
                queries::set_exported_head(conn, full_name, head)?;
            }
            Ok(())
        })?;

        report.exported = pushed;
        info!(
            remote = %options.remote,
            exported = report.exported.len(),
            up_to_date = report.up_to_date.len(),
            "export finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // import
    // -----------------------------------------------------------------------

    /// Bring remote versions into the workspace.
    ///
    /// Every target is classified before anything is written. Without a merge
    /// strategy, diverged or locally modified components fail together in one
    /// error; unrelated histories fail unless explicitly allowed. A tracked
    /// component that was never tagged but has files on disk counts as an
    /// unrelated history.
    pub fn import(&self, options: &ImportOptions) -> Result<ImportReport, CoreError> {
        if options.path.is_some() && options.ids.len() != 1 {
            return Err(UserInputError::PathWithManyComponents.into());
        }
        let mut map = self.load_map()?;
        reconcile(&mut map, &self.scope, &self.config.workspace.default_directory)?;

        let mut ids = if options.ids.is_empty() {
            map.entries().map(WorkspaceEntry::full_name).collect::<Vec<_>>()
        } else {
            options
                .ids
                .iter()
                .map(|id| self.full_name_of(&map, id))
                .collect::<Result<Vec<_>, _>>()?
        };
        ids.sort();
        ids.dedup();
        let mut report = ImportReport::default();
        if ids.is_empty() {
            info!("nothing to import");
            return Ok(report);
        }

        let dispatcher = RemoteActionDispatcher::new(&self.scope);
        let fetched = dispatcher.fetch_ledgers(&options.remote, &ids)?;
        if !fetched.missing.is_empty() {
            if !options.ids.is_empty() {
                return Err(UserInputError::ComponentNotFound(fetched.missing.join(", ")).into());
            }
            debug!(missing = ?fetched.missing, "skipping components the remote does not have");
        }

        // Content of every remote version the local scope does not hold yet.
        let mut locals: BTreeMap<String, Option<VersionLedger>> = BTreeMap::new();
        let mut wanted = BTreeSet::new();
        for remote in &fetched.ledgers {
            remote.validate()?;
            let local = self.scope.load_ledger(remote.component())?;
            for v in remote.versions() {
                if !local.as_ref().is_some_and(|l| l.contains(&v.id)) {
                    wanted.insert(v.content_hash.clone());
                }
            }
            locals.insert(remote.component().to_string(), local);
        }
        let objects: BTreeMap<String, Vec<u8>> = if wanted.is_empty() {
            BTreeMap::new()
        } else {
            let trees: Vec<String> = wanted.into_iter().collect();
            dispatcher
                .fetch_objects(&options.remote, &trees)?
                .into_iter()
                .collect()
        };
        let store = ObjectView {
            scope: &self.scope,
            fetched: &objects,
        };

        let mut planned: Vec<Planned> = Vec::new();
        let mut conflicts: Vec<MergeConflict> = Vec::new();
        let mut modified: Vec<String> = Vec::new();
        let mut unrelated: Vec<String> = Vec::new();

        for remote in &fetched.ledgers {
            let full_name = remote.component().to_string();
            let Some(incoming) = remote.head_version().cloned() else {
                debug!(component = %full_name, "remote has no versions");
                continue;
            };
            let theirs = store.tree(&incoming.content_hash)?;
            let local = locals.get(&full_name).and_then(Option::as_ref);
            let Some(local_head) = local.and_then(VersionLedger::head_version) else {
                // Tracked but never tagged: files on disk are history of their own.
                let ours = match map.get(&full_name) {
                    Some(entry) => self.entry_tree(entry)?,
                    None => FileTree::new(),
                };
                if ours.is_empty() || ours == theirs {
                    planned.push(Planned::write(full_name, incoming, theirs, None, None));
                    continue;
                }
                match (options.allow_unrelated, options.merge) {
                    (false, _) => unrelated.push(full_name),
                    (true, None) => conflicts.push(MergeConflict {
                        versions: vec![incoming.tag.clone()],
                        id: full_name,
                        is_deleted: false,
                    }),
                    (true, Some(strategy)) => {
                        let labels = MergeLabels::new(UNTAGGED_LABEL, incoming.tag.clone());
                        let result = MergeEngine::merge(&full_name, None, &ours, &theirs, strategy, &labels);
                        planned.push(Planned::write(full_name, incoming, result.tree(), Some(result), None));
                    }
                }
                continue;
            };
            let local_ledger = local.cloned().unwrap_or_default();

            let entry = map.get(&full_name);
            let ours = match entry {
                Some(entry) => self.entry_tree(entry)?,
                None => store.tree(&local_head.content_hash)?,
            };
            let dirty = scope::tree_hash(&ours) != local_head.content_hash;
            let labels = MergeLabels::new(
                entry
                    .and_then(|e| e.version.clone())
                    .unwrap_or_else(|| local_head.tag.clone()),
                incoming.tag.clone(),
            );

            let mut graph = local_ledger;
            graph.union(remote);
            let relation = ConflictDetector::detect(&graph, &local_head.id, &incoming.id)?;
            let merge = |base: Option<&FileTree>, strategy: MergeStrategy| {
                MergeEngine::merge(&full_name, base, &ours, &theirs, strategy, &labels)
            };

            let step = match relation {
                Relation::UpToDate | Relation::FastForward(Side::Local) => Planned::skip(full_name, incoming),
                Relation::FastForward(Side::Remote) if !dirty => {
                    Planned::write(full_name, incoming, theirs, None, None)
                }
                Relation::FastForward(Side::Remote) => match options.merge {
                    None => {
                        modified.push(full_name);
                        continue;
                    }
                    Some(strategy) => {
                        let base = store.tree(&local_head.content_hash)?;
                        let result = merge(Some(&base), strategy);
                        Planned::write(full_name, incoming, result.tree(), Some(result), None)
                    }
                },
                Relation::Conflict(divergence) => match options.merge {
                    None => {
                        conflicts.push(MergeConflict {
                            versions: tags_of(&graph, &divergence.remote_only),
                            id: full_name,
                            is_deleted: false,
                        });
                        continue;
                    }
                    Some(strategy) => {
                        let base_hash = graph
                            .get(&divergence.base)
                            .map(|v| v.content_hash.clone())
                            .ok_or_else(|| LedgerError::VersionNotFound {
                                component: full_name.clone(),
                                version: divergence.base.to_string(),
                            })?;
                        let base = store.tree(&base_hash)?;
                        let result = merge(Some(&base), strategy);
                        let parent = Some(local_head.id.clone());
                        Planned::write(full_name, incoming, result.tree(), Some(result), parent)
                    }
                },
                Relation::Unrelated => match (options.allow_unrelated, options.merge) {
                    (false, _) => {
                        unrelated.push(full_name);
                        continue;
                    }
                    (true, None) => {
                        conflicts.push(MergeConflict {
                            versions: vec![incoming.tag.clone()],
                            id: full_name,
                            is_deleted: false,
                        });
                        continue;
                    }
                    (true, Some(strategy)) => {
                        let result = merge(None, strategy);
                        let parent = Some(local_head.id.clone());
                        Planned::write(full_name, incoming, result.tree(), Some(result), parent)
                    }
                },
            };
            planned.push(step);
        }

        match (conflicts.len(), modified.len(), unrelated.len()) {
            (0, 0, 0) => {}
            (0, 0, _) => return Err(SyncError::UnrelatedHistories(unrelated).into()),
            (1, 0, 0) => return Err(ConflictError::MergeConflict(conflicts.remove(0)).into()),
            _ => {
                return Err(ConflictError::ImportBlocked {
                    conflicts,
                    modified,
                    unrelated,
                }
                .into())
            }
        }

        // Everything is settled; from here on the disk changes.
        let requests: Vec<WriteRequest> = planned
            .iter()
            .filter_map(|p| {
                p.tree.as_ref().map(|tree| WriteRequest {
                    id: p.full_name.clone(),
                    desired_root: self.desired_root(&map, &p.full_name, options.path.as_deref()),
                    files: tree.clone(),
                })
            })
            .collect();
        let coordinator = WriteCoordinator::new(
            self.paths.root.clone(),
            self.paths.resolve(&self.config.write.staging_dir),
            map.roots(),
        );
        let plan = coordinator.plan(
            requests,
            &WriteOptions {
                override_dir: options.override_dir,
            },
        )?;
        if !plan.writes.is_empty() {
            coordinator.persist(&plan)?;
        }

        let mut batch = IngestBatch::default();
        for remote in &fetched.ledgers {
            let local = locals.get(remote.component()).and_then(Option::as_ref);
            batch.versions.extend(
                remote
                    .versions()
                    .filter(|v| !local.is_some_and(|l| l.contains(&v.id)))
                    .cloned(),
            );
        }
        batch.objects = objects.into_iter().collect();
        for p in &planned {
            batch.heads.push(HeadUpdate {
                component: p.full_name.clone(),
                head: p.tree.as_ref().map(|_| p.incoming.id.clone()),
                exported_head: Some(p.incoming.id.clone()),
            });
        }
        self.scope.ingest(&batch)?;

        for p in planned {
            if p.tree.is_none() {
                report.up_to_date.push(p.full_name);
                continue;
            }
            report.imported.push(self.record_import(&mut map, &plan, p)?);
        }
        self.finish(&mut map)?;

        info!(
            remote = %options.remote,
            imported = report.imported.len(),
            up_to_date = report.up_to_date.len(),
            "import finished"
        );
        Ok(report)
    }

    /// Point the workspace entry of an imported component at its new version
    /// and root.
    fn record_import(
        &self,
        map: &mut WorkspaceMap,
        plan: &WritePlan,
        planned: Planned,
    ) -> Result<ImportedComponent, CoreError> {
        let write = plan
            .writes
            .iter()
            .find(|w| w.id == planned.full_name)
            .ok_or_else(|| UserInputError::ComponentNotFound(planned.full_name.clone()))?;

        let mut entry = match map.get(&planned.full_name) {
            Some(entry) => entry.clone(),
            None => WorkspaceEntry::new(
                &ComponentId::parse(&planned.full_name)?,
                &write.root,
                Origin::Imported,
            ),
        };
        entry.root_dir = write.root.clone();
        entry.version = Some(planned.incoming.tag.clone());
        entry.merge_parent = planned.merge_parent;
        map.upsert(entry);

        let (strategy, conflicted_files, modified) = match &planned.merge {
            Some(merge) => (
                Some(merge.strategy),
                merge.conflicted_paths().into_iter().map(str::to_string).collect(),
                merge.modified,
            ),
            None => (None, Vec::new(), false),
        };
        if !conflicted_files.is_empty() {
            warn!(component = %planned.full_name, files = ?conflicted_files, "merged with conflicts");
        }
        Ok(ImportedComponent {
            id: planned.full_name,
            version: planned.incoming.tag,
            root: write.root.clone(),
            renamed_from: write.renamed_from.clone(),
            strategy,
            conflicted_files,
            modified,
        })
    }

    // -----------------------------------------------------------------------
    // status
    // -----------------------------------------------------------------------

    /// Reconcile the workspace map, then report every tracked component.
    pub fn status(&self) -> Result<StatusReport, CoreError> {
        let mut map = self.load_map()?;
        let reconciliation = reconcile(&mut map, &self.scope, &self.config.workspace.default_directory)?;

        let mut components = Vec::with_capacity(map.len());
        for entry in map.entries() {
            let full_name = entry.full_name();
            let record = self.scope.get_component(&full_name)?;
            let ledger = self.scope.load_ledger(&full_name)?;

            let recorded = entry
                .version
                .as_deref()
                .and_then(|tag| ledger.as_ref()?.by_tag(tag));
            let modified = match recorded {
                Some(version) => scope::tree_hash(&self.entry_tree(entry)?) != version.content_hash,
                None => false,
            };
            let staged = record
                .as_ref()
                .is_some_and(|r| r.head.is_some() && r.head != r.exported_head);
            components.push(ComponentStatus {
                id: full_name,
                version: entry.version.clone(),
                new: record.and_then(|r| r.head).is_none(),
                modified,
                staged,
            });
        }
        map.save()?;

        debug!(
            components = components.len(),
            mutations = reconciliation.mutations(),
            "status computed"
        );
        Ok(StatusReport {
            components,
            changes: reconciliation.changes,
            stale: reconciliation.stale,
        })
    }

    // -----------------------------------------------------------------------
    // remotes
    // -----------------------------------------------------------------------

    /// Run a named action against a configured remote.
    pub fn run_action(
        &self,
        action: &str,
        remote: &str,
        options: Map<String, Value>,
    ) -> Result<Value, CoreError> {
        Ok(RemoteActionDispatcher::new(&self.scope).run_action(action, remote, options)?)
    }

    pub fn add_remote(&self, name: &str, location: &str) -> Result<(), CoreError> {
        self.scope.add_remote(name, location)?;
        info!(name, location, "added remote");
        Ok(())
    }

    pub fn remove_remote(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.scope.remove_remote(name)?)
    }

    pub fn remotes(&self) -> Result<Vec<RemoteRecord>, CoreError> {
        Ok(self.scope.remotes()?)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn load_map(&self) -> Result<WorkspaceMap, CoreError> {
        Ok(WorkspaceMap::load(self.paths.bitmap())?)
    }

    /// Record the scope fingerprint and save the map.
    fn finish(&self, map: &mut WorkspaceMap) -> Result<(), CoreError> {
        map.set_fingerprint(&self.scope.fingerprint()?);
        map.save()?;
        Ok(())
    }

    fn entry_tree(&self, entry: &WorkspaceEntry) -> Result<FileTree, CoreError> {
        Ok(fsutil::read_dir_tree(&self.paths.resolve(&entry.root_dir))?)
    }

    fn tracked_targets(&self, map: &WorkspaceMap, ids: &[String]) -> Result<Vec<WorkspaceEntry>, CoreError> {
        if ids.is_empty() {
            return Ok(map.entries().cloned().collect());
        }
        ids.iter()
            .map(|id| {
                map.find(id)
                    .cloned()
                    .ok_or_else(|| CoreError::from(UserInputError::ComponentNotFound(id.clone())))
            })
            .collect()
    }

    /// `scope/name` for a tracked entry or a fully qualified id.
    fn full_name_of(&self, map: &WorkspaceMap, id: &str) -> Result<String, CoreError> {
        if let Some(entry) = map.find(id) {
            return Ok(entry.full_name());
        }
        if !id.contains('/') {
            return Err(UserInputError::ComponentNotFound(id.to_string()).into());
        }
        Ok(ComponentId::parse(id)?.full_name())
    }

    fn export_targets(&self, map: &WorkspaceMap, ids: &[String]) -> Result<Vec<String>, CoreError> {
        let mut targets = if ids.is_empty() {
            self.scope
                .list_components()?
                .into_iter()
                .filter(|r| r.head.is_some() && r.head != r.exported_head)
                .map(|r| r.full_name)
                .collect()
        } else {
            ids.iter()
                .map(|id| self.full_name_of(map, id))
                .collect::<Result<Vec<_>, _>>()?
        };
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    fn desired_root(&self, map: &WorkspaceMap, full_name: &str, path: Option<&str>) -> String {
        if let Some(path) = path {
            return fsutil::normalize_rel(path);
        }
        if let Some(entry) = map.get(full_name) {
            return entry.root_dir.clone();
        }
        let name = full_name.split_once('/').map_or(full_name, |(_, name)| name);
        fsutil::normalize_rel(&format!("{}/{}", self.config.workspace.default_directory, name))
    }
}

// ---------------------------------------------------------------------------
// Import plumbing
// ---------------------------------------------------------------------------

/// One classified import target.
struct Planned {
    full_name: String,
    incoming: Version,
    /// Files to write; `None` when the component is already up to date.
    tree: Option<FileTree>,
    merge: Option<ComponentMerge>,
    /// Local head to keep as second parent of the next tag.
    merge_parent: Option<VersionId>,
}

impl Planned {
    fn skip(full_name: String, incoming: Version) -> Self {
        Self {
            full_name,
            incoming,
            tree: None,
            merge: None,
            merge_parent: None,
        }
    }

    fn write(
        full_name: String,
        incoming: Version,
        tree: FileTree,
        merge: Option<ComponentMerge>,
        merge_parent: Option<VersionId>,
    ) -> Self {
        Self {
            full_name,
            incoming,
            tree: Some(tree),
            merge,
            merge_parent,
        }
    }
}

/// Reads trees from freshly fetched objects first, then from the local scope.
struct ObjectView<'a> {
    scope: &'a Scope,
    fetched: &'a BTreeMap<String, Vec<u8>>,
}

impl ObjectView<'_> {
    fn object(&self, hash: &str) -> Result<Vec<u8>, CoreError> {
        if let Some(content) = self.fetched.get(hash) {
            return Ok(content.clone());
        }
        self.scope.get_object(hash)?.ok_or_else(|| {
            DatabaseError::NotFound {
                entity: "object".into(),
                id: hash.to_string(),
            }
            .into()
        })
    }

    fn tree(&self, tree_hash: &str) -> Result<FileTree, CoreError> {
        let raw = self.object(tree_hash)?;
        let manifest: BTreeMap<String, String> =
            serde_json::from_slice(&raw).map_err(|e| DatabaseError::Corrupt {
                entity: "tree".into(),
                id: tree_hash.to_string(),
                detail: e.to_string(),
            })?;
        manifest
            .into_iter()
            .map(|(path, hash)| self.object(&hash).map(|content| (path, content)))
            .collect()
    }
}

/// Conflict marker label for workspace files that were never tagged.
const UNTAGGED_LABEL: &str = "untagged";

/// Next patch after the highest tag in the ledger, `0.0.1` for the first.
fn next_tag(ledger: &VersionLedger) -> String {
    ledger
        .versions()
        .filter_map(|v| SemVer::parse(&v.tag).ok())
        .max()
        .map_or_else(SemVer::default, |v| v.next_patch())
        .to_string()
}

fn tags_of(graph: &VersionLedger, ids: &[VersionId]) -> Vec<String> {
    ids.iter()
        .filter_map(|id| graph.get(id))
        .map(|v| v.tag.clone())
        .collect()
}
