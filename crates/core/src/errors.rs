//! Error types for the scopesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    UserInput(#[from] UserInputError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// User input errors
// ---------------------------------------------------------------------------

/// Bad input detected before any mutation is attempted.
#[derive(Debug, Error)]
pub enum UserInputError {
    /// The merge strategy is not one of the enumerated values.
    #[error("merge must be one of the following: manual, theirs, ours (got '{0}')")]
    InvalidStrategy(String),

    /// A component id failed validation.
    #[error("invalid component id '{id}': {detail}")]
    InvalidComponentId { id: String, detail: String },

    /// A version string is not `MAJOR.MINOR.PATCH`.
    #[error("invalid version '{0}', expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    /// The component is not tracked by the workspace or known to the scope.
    #[error("component not found: {0}")]
    ComponentNotFound(String),

    /// The target path exists as a plain file.
    #[error("unable to write to {0} because it's a file")]
    TargetIsFile(PathBuf),

    /// The target directory is not empty and not tracked.
    #[error(
        "unable to write to {0}, the directory is not empty. use the override flag to replace the directory"
    )]
    DirectoryNotEmpty(PathBuf),

    /// The target directory does not exist (when adding a component).
    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    /// A root directory would live inside another component's root.
    #[error("root directory '{root}' is inside '{parent}', which is tracked by {owner}")]
    NestedRoot {
        root: String,
        parent: String,
        owner: String,
    },

    /// The component is already tracked.
    #[error("component {0} is already tracked")]
    AlreadyTracked(String),

    /// The tag already exists in the component's ledger.
    #[error("version {version} of {id} already exists")]
    DuplicateTag { id: String, version: String },

    /// The path is not inside the workspace.
    #[error("{0} is outside the workspace")]
    OutsideWorkspace(PathBuf),

    /// The component has never been tagged, so there is nothing to export.
    #[error("component {0} has no tagged version, tag it first")]
    NotTagged(String),

    /// A path override was given together with more than one component.
    #[error("a target path can only be given when importing a single component")]
    PathWithManyComponents,
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// A component whose local history diverges from the incoming one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub id: String,
    pub versions: Vec<String>,
    /// Only relevant on the export path.
    pub is_deleted: bool,
}

impl std::fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "versions conflict occurred while importing the component {}. conflict version(s): {}\n\
             to resolve it and merge your local and remote changes, please do the following:\n\
             1) reset {}\n\
             2) import\n\
             3) checkout head {}\n\
             once your changes are merged with the new remote version, you can tag and export a new version of the component to the remote scope.",
            self.id,
            self.versions.join(", "),
            self.id,
            self.id
        )
    }
}

/// One component rejected by a remote during export.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteConflict {
    pub id: String,
    pub versions: Vec<String>,
}

/// Expected, recoverable divergence between histories.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// A single component diverged while importing.
    #[error("error: {0}")]
    MergeConflict(MergeConflict),

    /// Several components could not be imported; every one is listed.
    #[error("{}", format_import_blocked(.conflicts, .modified, .unrelated))]
    ImportBlocked {
        conflicts: Vec<MergeConflict>,
        modified: Vec<String>,
        /// Components whose history shares nothing with the remote one.
        unrelated: Vec<String>,
    },

    /// The remote holds versions the local workspace has not merged.
    #[error("{}", format_remote_conflicts(.conflicts, .new_on_remote))]
    MergeConflictOnRemote {
        conflicts: Vec<RemoteConflict>,
        new_on_remote: Vec<String>,
    },
}

fn format_import_blocked(conflicts: &[MergeConflict], modified: &[String], unrelated: &[String]) -> String {
    let mut out = String::new();
    if !conflicts.is_empty() {
        out.push_str("error: versions conflict occurred while importing the following components:\n");
        for c in conflicts {
            out.push_str(&format!("  {} (conflict version(s): {})\n", c.id, c.versions.join(", ")));
        }
        out.push_str("use the merge flag to merge them, or reset the local versions and import again\n");
    }
    if !modified.is_empty() {
        out.push_str("error: the following components are modified locally:\n");
        for id in modified {
            out.push_str(&format!("  {id}\n"));
        }
        out.push_str("use the merge flag to merge the incoming changes into the modified files\n");
    }
    if !unrelated.is_empty() {
        out.push_str("error: the history of the following components is unrelated to the remote:\n");
        for id in unrelated {
            out.push_str(&format!("  {id}\n"));
        }
        out.push_str("re-run with the allow-unrelated flag to merge anyway\n");
    }
    out.trim_end().to_string()
}

fn format_remote_conflicts(conflicts: &[RemoteConflict], new_on_remote: &[String]) -> String {
    let mut out = String::new();
    if !conflicts.is_empty() {
        out.push_str("error: merge conflict occurred when exporting the component(s):\n");
        for c in conflicts {
            out.push_str(&format!("  {} (version(s): {})\n", c.id, c.versions.join(", ")));
        }
        out.push_str(
            "to resolve this conflict and merge your local and remote changes, please import the component(s) with the merge flag, tag and export again\n",
        );
    }
    if !new_on_remote.is_empty() {
        out.push_str("error: the following component(s) were created on the remote with an unrelated history:\n");
        for id in new_on_remote {
            out.push_str(&format!("  {id}\n"));
        }
    }
    out.trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Histories that cannot be merged, or workspace state that drifted.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local and remote ledgers share no common ancestor.
    #[error(
        "component history is unrelated to the remote for: {}. re-run with the allow-unrelated flag to merge anyway",
        .0.join(", ")
    )]
    UnrelatedHistories(Vec<String>),

    /// The workspace map could not be read or written.
    #[error("workspace map error at '{path}': {detail}")]
    WorkspaceMap { path: PathBuf, detail: String },
}

// ---------------------------------------------------------------------------
// Remote errors
// ---------------------------------------------------------------------------

/// Errors from the transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote location uses a protocol this build cannot reach.
    #[error("unsupported remote protocol: {0}")]
    UnsupportedProtocol(String),

    /// The remote could not be opened.
    #[error("remote unreachable at '{location}': {detail}")]
    Unreachable { location: String, detail: String },

    /// The remote answered with something that could not be decoded.
    #[error("invalid remote payload: {0}")]
    InvalidPayload(String),

    /// The remote refused the request.
    #[error("remote rejected the request: {0}")]
    Rejected(String),
}

/// Errors from the remote action dispatcher.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote name is not configured on the scope.
    #[error("remote '{0}' is not configured on this scope")]
    UnknownRemote(String),

    /// The action is outside the closed action set.
    #[error("unknown remote action '{name}', expected one of: {}", .valid.join(", "))]
    UnknownAction { name: String, valid: Vec<String> },

    /// The transport failed while running the action.
    #[error("remote action '{action}' failed on '{remote}': {source}")]
    ActionFailed {
        remote: String,
        action: String,
        #[source]
        source: TransportError,
    },

    /// Local scope access failed while resolving the remote.
    #[error("remote scope error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Ledger errors
// ---------------------------------------------------------------------------

/// Invariant violations in a version ledger. Always fatal.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A parent link points at a version that does not exist.
    #[error("invalid ledger for {component}: version {version} references missing parent {parent}")]
    InvalidLedger {
        component: String,
        version: String,
        parent: String,
    },

    /// Parent links form a cycle.
    #[error("invalid ledger for {component}: cyclic parent links at version {version}")]
    CyclicParents { component: String, version: String },

    /// A version has more than two parents.
    #[error("invalid ledger for {component}: version {version} has {count} parents")]
    TooManyParents {
        component: String,
        version: String,
        count: usize,
    },

    /// A version id or tag is not in the ledger.
    #[error("version {version} not found in ledger of {component}")]
    VersionNotFound { component: String, version: String },
}

// ---------------------------------------------------------------------------
// Write errors
// ---------------------------------------------------------------------------

/// Errors from persisting a batch of components.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Filesystem error at a specific path.
    #[error("write failed at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Flushing one component failed. Its files were rolled back; the listed
    /// components had already been flushed and stay on disk.
    #[error("failed to flush {component} ({detail}); already written: [{}]", .flushed.join(", "))]
    PartialFlush {
        component: String,
        detail: String,
        flushed: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite scope storage.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record or the scope itself does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored record could not be decoded.
    #[error("corrupt {entity} record '{id}': {detail}")]
    Corrupt {
        entity: String,
        id: String,
        detail: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_strategy_lists_options() {
        let err = UserInputError::InvalidStrategy("invalid".into());
        let msg = err.to_string();
        assert!(msg.contains("merge must be one of the following"));
        assert!(msg.contains("manual, theirs, ours"));
    }

    #[test]
    fn test_merge_conflict_message() {
        let err = ConflictError::MergeConflict(MergeConflict {
            id: "remote/bar/foo".into(),
            versions: vec!["0.0.2".into()],
            is_deleted: false,
        });
        let msg = err.to_string();
        assert!(msg.contains("remote/bar/foo"));
        assert!(msg.contains("conflict version(s): 0.0.2"));
    }

    #[test]
    fn test_remote_conflict_lists_every_component() {
        let err = ConflictError::MergeConflictOnRemote {
            conflicts: vec![
                RemoteConflict {
                    id: "remote/bar/foo".into(),
                    versions: vec!["0.0.2".into()],
                },
                RemoteConflict {
                    id: "remote/bar2/foo2".into(),
                    versions: vec!["0.0.2".into()],
                },
            ],
            new_on_remote: vec![],
        };
        let msg = err.to_string();
        assert!(msg.contains("remote/bar/foo (version(s): 0.0.2)"));
        assert!(msg.contains("remote/bar2/foo2 (version(s): 0.0.2)"));
    }

    #[test]
    fn test_import_blocked_lists_every_kind() {
        let err = ConflictError::ImportBlocked {
            conflicts: vec![MergeConflict {
                id: "bar/a".into(),
                versions: vec!["0.0.2".into()],
                is_deleted: false,
            }],
            modified: vec!["bar/m".into()],
            unrelated: vec!["bar/u".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("bar/a (conflict version(s): 0.0.2)"));
        assert!(msg.contains("  bar/m"));
        assert!(msg.contains("  bar/u"));
        assert!(msg.contains("allow-unrelated"));
    }

    #[test]
    fn test_action_failed_keeps_context() {
        let err = RemoteError::ActionFailed {
            remote: "origin".into(),
            action: "push".into(),
            source: TransportError::Unreachable {
                location: "/nope".into(),
                detail: "missing".into(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("origin"));
        assert!(msg.contains("push"));
        assert!(msg.contains("/nope"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = UserInputError::InvalidVersion("x".into()).into();
        assert!(matches!(err, CoreError::UserInput(_)));

        let err: CoreError = SyncError::UnrelatedHistories(vec!["s/a".into()]).into();
        assert!(matches!(err, CoreError::Sync(_)));
    }
}
