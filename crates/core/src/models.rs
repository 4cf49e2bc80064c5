//! Domain model types used throughout scopesync.
//!
//! These types bridge the ledger, the workspace map, the merge engine and
//! the remote actions.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::UserInputError;

/// File contents of one component, keyed by `/`-separated relative path.
pub type FileTree = BTreeMap<String, Vec<u8>>;

// ---------------------------------------------------------------------------
// Component id
// ---------------------------------------------------------------------------

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("static regex is valid")
    })
}

/// Scope-qualified component name, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId {
    scope: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl ComponentId {
    /// Build an unversioned id, validating both parts.
    pub fn new(scope: &str, name: &str) -> Result<Self, UserInputError> {
        let id = format!("{scope}/{name}");
        if scope.is_empty() || scope.contains('/') || !segment_re().is_match(scope) {
            return Err(UserInputError::InvalidComponentId {
                id,
                detail: "scope must be a single path segment".into(),
            });
        }
        if name.is_empty() || !name.split('/').all(|s| segment_re().is_match(s)) {
            return Err(UserInputError::InvalidComponentId {
                id,
                detail: "name segments may only contain letters, digits, '.', '_' and '-'".into(),
            });
        }
        Ok(Self {
            scope: scope.to_string(),
            name: name.to_string(),
            version: None,
        })
    }

    /// Parse `scope/name[@version]`. The first segment is always the scope.
    pub fn parse(s: &str) -> Result<Self, UserInputError> {
        let (base, version) = split_version(s);
        let (scope, name) = base
            .split_once('/')
            .ok_or_else(|| UserInputError::InvalidComponentId {
                id: s.to_string(),
                detail: "expected scope/name".into(),
            })?;
        let id = Self::new(scope, name)?;
        match version {
            Some(v) => id.with_version(v),
            None => Ok(id),
        }
    }

    /// Return a copy pinned to `version`.
    pub fn with_version(&self, version: &str) -> Result<Self, UserInputError> {
        SemVer::parse(version)?;
        Ok(Self {
            version: Some(version.to_string()),
            ..self.clone()
        })
    }

    /// Return a copy without a version.
    pub fn without_version(&self) -> Self {
        Self {
            version: None,
            ..self.clone()
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// `scope/name`, the key used by scopes and remotes.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}/{}@{}", self.scope, self.name, v),
            None => write!(f, "{}/{}", self.scope, self.name),
        }
    }
}

/// Split `id@version` into its parts.
pub fn split_version(s: &str) -> (&str, Option<&str>) {
    match s.rsplit_once('@') {
        Some((base, v)) if !v.is_empty() => (base, Some(v)),
        _ => (s, None),
    }
}

// ---------------------------------------------------------------------------
// Semantic versions
// ---------------------------------------------------------------------------

/// A `MAJOR.MINOR.PATCH` version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    pub fn parse(s: &str) -> Result<Self, UserInputError> {
        let invalid = || UserInputError::InvalidVersion(s.to_string());
        let mut parts = s.split('.');
        let mut next = || -> Result<u64, UserInputError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u64>()
                .map_err(|_| invalid())
        };
        let v = Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if s.split('.').count() != 3 {
            return Err(invalid());
        }
        Ok(v)
    }

    pub fn next_patch(&self) -> Self {
        Self {
            patch: self.patch + 1,
            ..*self
        }
    }
}

impl Default for SemVer {
    /// The version of a first tag.
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            patch: 1,
        }
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Workspace-facing enums
// ---------------------------------------------------------------------------

/// How a component came to be in the workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Authored,
    Imported,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authored => write!(f, "authored"),
            Self::Imported => write!(f, "imported"),
        }
    }
}

/// Per-component line of a status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentStatus {
    pub id: String,
    pub version: Option<String>,
    /// Never tagged in any scope the workspace knows.
    pub new: bool,
    /// On-disk content differs from the recorded version.
    pub modified: bool,
    /// Tagged locally but not exported yet.
    pub staged: bool,
}

impl ComponentStatus {
    pub fn is_clean(&self) -> bool {
        !self.new && !self.modified && !self.staged
    }
}
