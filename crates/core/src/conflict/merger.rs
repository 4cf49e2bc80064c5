//! Three-way merge engine.
//!
//! Uses the `diffy` crate to perform line-based three-way merges between a
//! base, "ours" (the workspace) and "theirs" (the incoming version) of every
//! file in a component, then relabels diffy's conflict markers with the
//! local and incoming version tags.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::strategy::MergeStrategy;
use crate::models::FileTree;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Version labels written into conflict markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLabels {
    /// Version the workspace had checked out.
    pub local: String,
    /// Version being imported.
    pub incoming: String,
}

impl MergeLabels {
    pub fn new(local: impl Into<String>, incoming: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            incoming: incoming.into(),
        }
    }

    fn opening(&self) -> String {
        format!("<<<<<<< {} modified", self.local)
    }

    fn closing(&self) -> String {
        format!(">>>>>>> {}", self.incoming)
    }
}

/// A single conflict region within merged output. Lines are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictMarker {
    pub start_line: usize,
    pub separator_line: usize,
    pub end_line: usize,
}

/// Merge outcome for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileMerge {
    /// Content to write; no markers.
    Clean(Vec<u8>),
    /// At least one overlapping hunk. `merged` is what gets written.
    Conflicted {
        base: Option<Vec<u8>>,
        ours: Option<Vec<u8>>,
        theirs: Option<Vec<u8>>,
        merged: Vec<u8>,
        markers: Vec<ConflictMarker>,
    },
}

impl FileMerge {
    /// Bytes that end up on disk.
    pub fn content(&self) -> &[u8] {
        match self {
            Self::Clean(content) => content,
            Self::Conflicted { merged, .. } => merged,
        }
    }

    pub fn is_conflicted(&self) -> bool {
        matches!(self, Self::Conflicted { .. })
    }
}

/// Merge outcome for a whole component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMerge {
    pub component: String,
    pub strategy: MergeStrategy,
    /// Files to write, keyed by relative path.
    pub files: BTreeMap<String, FileMerge>,
    /// Files present locally that the result drops.
    pub removed: Vec<String>,
    /// The written tree differs from the incoming version's tree.
    pub modified: bool,
}

impl ComponentMerge {
    pub fn has_conflicts(&self) -> bool {
        self.files.values().any(FileMerge::is_conflicted)
    }

    pub fn conflicted_paths(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|(_, f)| f.is_conflicted())
            .map(|(p, _)| p.as_str())
            .collect()
    }

    /// The tree that will be on disk after writing.
    pub fn tree(&self) -> FileTree {
        self.files
            .iter()
            .map(|(p, f)| (p.clone(), f.content().to_vec()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless three-way merge engine.
pub struct MergeEngine;

impl MergeEngine {
    /// Merge a component's local tree with an incoming tree.
    ///
    /// `base` is the tree of the lowest common ancestor, or `None` when the
    /// histories share nothing (an empty base is used for text merges).
    /// Files that are byte-identical on both sides are always clean and
    /// never count as a modification.
    pub fn merge(
        component: &str,
        base: Option<&FileTree>,
        ours: &FileTree,
        theirs: &FileTree,
        strategy: MergeStrategy,
        labels: &MergeLabels,
    ) -> ComponentMerge {
        info!(
            component,
            strategy = %strategy,
            local = %labels.local,
            incoming = %labels.incoming,
            "merging component"
        );

        let paths: BTreeSet<&String> = ours.keys().chain(theirs.keys()).collect();
        let mut files = BTreeMap::new();
        let mut removed = Vec::new();

        for path in paths {
            let o = ours.get(path).map(Vec::as_slice);
            let t = theirs.get(path).map(Vec::as_slice);
            let b = base.and_then(|b| b.get(path)).map(Vec::as_slice);

            match merge_entry(b, o, t, strategy, labels) {
                Some(result) => {
                    files.insert(path.clone(), result);
                }
                None if o.is_some() => removed.push(path.clone()),
                None => {}
            }
        }

        let written: FileTree = files
            .iter()
            .map(|(p, f): (&String, &FileMerge)| (p.clone(), f.content().to_vec()))
            .collect();
        let modified = written != *theirs;
        let merge = ComponentMerge {
            component: component.to_string(),
            strategy,
            files,
            removed,
            modified,
        };
        debug!(
            component,
            files = merge.files.len(),
            removed = merge.removed.len(),
            conflicts = merge.conflicted_paths().len(),
            modified,
            "merge finished"
        );
        merge
    }

    /// Three-way merge of text. Returns the merged text and the positions of
    /// every conflict region, relabelled with `labels`.
    pub fn merge_text(
        base: &str,
        ours: &str,
        theirs: &str,
        labels: &MergeLabels,
    ) -> (String, Vec<ConflictMarker>) {
        // Fast paths: one side unchanged, or both made the same change.
        if ours == theirs || theirs == base {
            return (ours.to_string(), Vec::new());
        }
        if ours == base {
            return (theirs.to_string(), Vec::new());
        }

        let marker_len = marker_length(&[base, ours, theirs]);
        let mut options = diffy::MergeOptions::new();
        options
            .set_conflict_marker_length(marker_len)
            .set_conflict_style(diffy::ConflictStyle::Merge);

        match options.merge(base, ours, theirs) {
            Ok(merged) => {
                debug!("clean three-way merge");
                (merged, Vec::new())
            }
            Err(conflicted) => {
                let (text, markers) = relabel(&conflicted, marker_len, labels);
                debug!(regions = markers.len(), "three-way merge has conflicts");
                (text, markers)
            }
        }
    }
}

/// Merge one path. `None` means the path is absent from the result.
fn merge_entry(
    base: Option<&[u8]>,
    ours: Option<&[u8]>,
    theirs: Option<&[u8]>,
    strategy: MergeStrategy,
    labels: &MergeLabels,
) -> Option<FileMerge> {
    if ours == theirs {
        return ours.map(|o| FileMerge::Clean(o.to_vec()));
    }
    match strategy {
        MergeStrategy::Theirs => return theirs.map(|t| FileMerge::Clean(t.to_vec())),
        MergeStrategy::Ours => return ours.map(|o| FileMerge::Clean(o.to_vec())),
        MergeStrategy::Manual => {}
    }

    let conflicted = |merged: &[u8]| FileMerge::Conflicted {
        base: base.map(<[u8]>::to_vec),
        ours: ours.map(<[u8]>::to_vec),
        theirs: theirs.map(<[u8]>::to_vec),
        merged: merged.to_vec(),
        markers: Vec::new(),
    };

    match (ours, theirs) {
        // Deleted locally.
        (None, Some(t)) => match base {
            Some(b) if b == t => None,
            None => Some(FileMerge::Clean(t.to_vec())),
            Some(_) => Some(conflicted(t)),
        },
        // Deleted by the incoming version.
        (Some(o), None) => match base {
            Some(b) if b == o => None,
            None => Some(FileMerge::Clean(o.to_vec())),
            Some(_) => Some(conflicted(o)),
        },
        (Some(o), Some(t)) => {
            let b = base.unwrap_or_default();
            if b == o {
                return Some(FileMerge::Clean(t.to_vec()));
            }
            if b == t {
                return Some(FileMerge::Clean(o.to_vec()));
            }
            let (Ok(b), Ok(o_text), Ok(t_text)) = (
                std::str::from_utf8(b),
                std::str::from_utf8(o),
                std::str::from_utf8(t),
            ) else {
                // Binary content cannot carry markers; keep the local bytes.
                return Some(conflicted(o));
            };
            let (merged, markers) = MergeEngine::merge_text(b, o_text, t_text, labels);
            if markers.is_empty() {
                Some(FileMerge::Clean(merged.into_bytes()))
            } else {
                Some(FileMerge::Conflicted {
                    base: base.map(<[u8]>::to_vec),
                    ours: Some(o.to_vec()),
                    theirs: Some(t.to_vec()),
                    merged: merged.into_bytes(),
                    markers,
                })
            }
        }
        (None, None) => None,
    }
}

/// Marker length that cannot collide with any line already in the inputs.
fn marker_length(inputs: &[&str]) -> usize {
    let longest = inputs
        .iter()
        .flat_map(|s| s.lines())
        .filter_map(|line| {
            let first = line.chars().next()?;
            if !matches!(first, '<' | '=' | '>') {
                return None;
            }
            Some(line.chars().take_while(|c| *c == first).count())
        })
        .max()
        .unwrap_or(0);
    (longest + 1).max(7)
}

/// Rewrite diffy's `ours`/`theirs` markers into version-tagged markers.
fn relabel(conflicted: &str, marker_len: usize, labels: &MergeLabels) -> (String, Vec<ConflictMarker>) {
    let open = format!("{} ours", "<".repeat(marker_len));
    let sep = "=".repeat(marker_len);
    let close = format!("{} theirs", ">".repeat(marker_len));

    let mut out = String::with_capacity(conflicted.len());
    let mut markers = Vec::new();
    let mut start = 0;
    let mut separator = 0;

    for (idx, raw) in conflicted.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        let (body, eol) = match raw.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (raw, ""),
        };
        if body == open {
            start = line_no;
            out.push_str(&labels.opening());
        } else if body == sep && start != 0 {
            separator = line_no;
            out.push_str("=======");
        } else if body == close && start != 0 {
            markers.push(ConflictMarker {
                start_line: start,
                separator_line: separator,
                end_line: line_no,
            });
            start = 0;
            out.push_str(&labels.closing());
        } else {
            out.push_str(body);
        }
        out.push_str(eol);
    }
    (out, markers)
}
