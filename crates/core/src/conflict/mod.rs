//! Divergence detection, three-way merging, and merge strategies.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- classifying two ledger heads as up to date, fast-forward,
//!    diverged or unrelated.
//! 2. **Merging** -- three-way merging the files of a diverged component.
//! 3. **Strategy** -- the user-selected policy deciding which side wins.

pub mod detector;
pub mod merger;
pub mod strategy;

pub use detector::{ConflictDetector, Divergence, Relation, Side};
pub use merger::{ComponentMerge, ConflictMarker, FileMerge, MergeEngine, MergeLabels};
pub use strategy::MergeStrategy;
