//! Ledger divergence detection.
//!
//! Given one version graph and two heads, the detector decides whether one
//! head fast-forwards to the other, whether they diverged from a common
//! ancestor, or whether their histories are unrelated.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::LedgerError;
use crate::ledger::{VersionId, VersionLedger};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One of the two heads being compared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn flip(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// The versions on each side of a divergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Lowest common ancestor of both heads.
    pub base: VersionId,
    /// Versions reachable from the local head only, nearest first.
    pub local_only: Vec<VersionId>,
    /// Versions reachable from the remote head only, nearest first.
    pub remote_only: Vec<VersionId>,
}

/// Relationship between a local and a remote head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// Both heads are the same version.
    UpToDate,
    /// The named side is strictly ahead; the other head is its ancestor.
    FastForward(Side),
    /// Neither is an ancestor of the other but they share history.
    Conflict(Divergence),
    /// No common ancestor exists.
    Unrelated,
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up_to_date"),
            Self::FastForward(side) => write!(f, "fast_forward({side})"),
            Self::Conflict(_) => write!(f, "conflict"),
            Self::Unrelated => write!(f, "unrelated"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless divergence detector over a version graph.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classify `local` against `remote` inside `graph`.
    ///
    /// `graph` must contain both heads and every ancestor of both; pass the
    /// union of the local and remote ledgers. Ancestor sets are expanded
    /// breadth-first from both heads and intersected. A dangling parent or a
    /// parent cycle fails with a [`LedgerError`] instead of looping.
    ///
    /// Swapping `local` and `remote` flips the fast-forward side and swaps the
    /// two halves of a divergence; every other classification is unchanged.
    pub fn detect(
        graph: &VersionLedger,
        local: &VersionId,
        remote: &VersionId,
    ) -> Result<Relation, LedgerError> {
        let local_anc = graph.ancestors(local)?;
        let remote_anc = graph.ancestors(remote)?;

        let relation = if local == remote {
            Relation::UpToDate
        } else if local_anc.contains_key(remote) {
            Relation::FastForward(Side::Local)
        } else if remote_anc.contains_key(local) {
            Relation::FastForward(Side::Remote)
        } else {
            match lowest_common_ancestor(graph, &local_anc, &remote_anc)? {
                None => Relation::Unrelated,
                Some(base) => Relation::Conflict(Divergence {
                    base: base.clone(),
                    local_only: only_in(&local_anc, &remote_anc),
                    remote_only: only_in(&remote_anc, &local_anc),
                }),
            }
        };

        info!(
            component = graph.component(),
            local = local.short(),
            remote = remote.short(),
            relation = %relation,
            "classified heads"
        );
        Ok(relation)
    }
}

/// Ancestors in `a` but not in `b`, nearest first, ties broken by id.
fn only_in(a: &HashMap<&VersionId, usize>, b: &HashMap<&VersionId, usize>) -> Vec<VersionId> {
    let mut out: Vec<(&VersionId, usize)> = a
        .iter()
        .filter(|(id, _)| !b.contains_key(**id))
        .map(|(id, d)| (*id, *d))
        .collect();
    out.sort_by(|x, y| x.1.cmp(&y.1).then_with(|| x.0.cmp(y.0)));
    out.into_iter().map(|(id, _)| id.clone()).collect()
}

/// Pick the lowest common ancestor: a common ancestor that is not itself an
/// ancestor of another common ancestor. Among several, the one with the
/// smallest combined distance wins, then the smallest id, so the choice does
/// not depend on argument order.
fn lowest_common_ancestor<'g>(
    graph: &'g VersionLedger,
    local_anc: &HashMap<&'g VersionId, usize>,
    remote_anc: &HashMap<&'g VersionId, usize>,
) -> Result<Option<&'g VersionId>, LedgerError> {
    let common: HashSet<&VersionId> = local_anc
        .keys()
        .filter(|id| remote_anc.contains_key(**id))
        .copied()
        .collect();
    if common.is_empty() {
        return Ok(None);
    }

    // Everything strictly below a common ancestor is not "lowest".
    let mut shadowed: HashSet<&VersionId> = HashSet::new();
    let mut queue: VecDeque<&VersionId> = VecDeque::new();
    for id in &common {
        if let Some(v) = graph.get(id) {
            for p in &v.parents {
                queue.push_back(p);
            }
        }
    }
    while let Some(id) = queue.pop_front() {
        if !shadowed.insert(id) {
            continue;
        }
        if let Some(v) = graph.get(id) {
            queue.extend(v.parents.iter());
        }
    }

    let best = common
        .into_iter()
        .filter(|id| !shadowed.contains(*id))
        .min_by(|a, b| {
            let da = local_anc[*a] + remote_anc[*a];
            let db = remote_anc[*b] + local_anc[*b];
            da.cmp(&db).then_with(|| a.cmp(b))
        });
    debug!(base = ?best.map(|b| b.short()), "lowest common ancestor");
    Ok(best)
}
