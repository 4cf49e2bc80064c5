//! Filesystem helpers shared by the workspace map and the write coordinator.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::WriteError;
use crate::models::FileTree;

/// Attach a path to an I/O error.
pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write data to a file atomically using temp-file-then-rename.
///
/// The temp file is synced before the rename, so readers see either the old
/// content or the new content, never a partial write.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), WriteError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(data).map_err(io_err(&tmp))?;
    file.sync_data().map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    Ok(())
}

/// Read every regular file below `dir` into a tree keyed by `/`-separated
/// relative paths. A missing directory reads as an empty tree.
pub fn read_dir_tree(dir: &Path) -> Result<FileTree, WriteError> {
    let mut tree = FileTree::new();
    if !dir.is_dir() {
        return Ok(tree);
    }
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| WriteError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let content = fs::read(entry.path()).map_err(io_err(entry.path()))?;
        tree.insert(to_slash(rel), content);
    }
    Ok(tree)
}

/// Join a `/`-separated relative path onto `root`.
pub fn join_rel(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |acc, s| acc.join(s))
}

/// Render a relative path with `/` separators.
pub fn to_slash(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize a workspace-relative directory string: `/` separators, no
/// leading `./`, no trailing slash.
pub fn normalize_rel(dir: &str) -> String {
    dir.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// True when `ancestor` is a strict path-prefix of `path`, segment-wise.
/// `a` is a prefix of `a/b` but not of `ab`.
pub fn is_strict_prefix(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Whether `dir` exists and holds at least one entry.
pub fn dir_has_entries(dir: &Path) -> Result<bool, WriteError> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let mut entries = fs::read_dir(dir).map_err(io_err(dir))?;
    Ok(entries.next().is_some())
}
