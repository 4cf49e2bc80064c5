//! Merge strategy selector.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::UserInputError;

/// How diverging file content is resolved during import.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Three-way text merge; overlapping hunks get conflict markers.
    #[default]
    Manual,
    /// Take the incoming content verbatim.
    Theirs,
    /// Keep the local content verbatim while still advancing the version.
    Ours,
}

impl MergeStrategy {
    pub const ALL: [MergeStrategy; 3] = [Self::Manual, Self::Theirs, Self::Ours];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Theirs => "theirs",
            Self::Ours => "ours",
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = UserInputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| UserInputError::InvalidStrategy(s.to_string()))
    }
}
