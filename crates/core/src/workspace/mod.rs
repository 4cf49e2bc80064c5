//! Workspace state: the persisted map of tracked components and its
//! reconciliation against the local scope.

pub mod bitmap;
pub mod sync;

use std::path::{Path, PathBuf};

pub use bitmap::{WorkspaceEntry, WorkspaceMap, BITMAP_FILE};
pub use sync::{reconcile, EntryChange, Reconciliation};

use crate::config::CONFIG_FILE_NAME;

/// Directory of the local scope, relative to the workspace root.
pub const LOCAL_SCOPE_DIR: &str = ".scope";

/// Well-known locations inside one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn bitmap(&self) -> PathBuf {
        self.root.join(BITMAP_FILE)
    }

    pub fn local_scope(&self) -> PathBuf {
        self.root.join(LOCAL_SCOPE_DIR)
    }

    /// Resolve a workspace-relative, `/`-separated path.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        crate::fsutil::join_rel(&self.root, rel)
    }

    /// Express `path` relative to the workspace root, if it is inside it.
    pub fn relativize(&self, path: &Path) -> Option<String> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        abs.strip_prefix(&self.root)
            .ok()
            .map(crate::fsutil::to_slash)
            .filter(|rel| !rel.is_empty())
    }
}
