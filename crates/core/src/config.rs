//! TOML-based workspace configuration.
//!
//! A workspace carries one `scopesync.toml` at its root. Every field has a
//! documented default except `workspace.default_scope`. The configuration is
//! built once per operation, validated, and never mutated afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflict::MergeStrategy;
use crate::errors::ConfigError;

/// File name of the workspace configuration.
pub const CONFIG_FILE_NAME: &str = "scopesync.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Workspace configuration loaded from `scopesync.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub workspace: WorkspaceSection,

    #[serde(default)]
    pub merge: MergeSection,

    #[serde(default)]
    pub write: WriteSection,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceSection {
    /// Scope new components are created in. Required; a single segment.
    pub default_scope: String,

    /// Where imported components land, relative to the workspace root
    /// (default `components`).
    #[serde(default = "default_directory")]
    pub default_directory: String,

    /// Minimum tracing level: trace, debug, info, warn, error (default `info`).
    /// The CLI uses it when neither `--log-level` nor RUST_LOG is set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_directory() -> String {
    "components".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Merge behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeSection {
    /// Strategy `import --merge` uses without an explicit value (default
    /// `manual`).
    #[serde(default)]
    pub default_strategy: MergeStrategy,
}

/// Write coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteSection {
    /// Staging area, relative to the workspace root (default `.scope/staging`).
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
}

fn default_staging_dir() -> String {
    ".scope/staging".into()
}

impl Default for WriteSection {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl WorkspaceConfig {
    /// A configuration with every default and the given scope.
    pub fn new(default_scope: &str) -> Self {
        Self {
            workspace: WorkspaceSection {
                default_scope: default_scope.to_string(),
                default_directory: default_directory(),
                log_level: default_log_level(),
            },
            merge: MergeSection::default(),
            write: WriteSection::default(),
        }
    }

    /// Load a [`WorkspaceConfig`] from a TOML file. Does not validate.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: WorkspaceConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scope = &self.workspace.default_scope;
        if scope.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "workspace.default_scope".into(),
                detail: "default scope must not be empty".into(),
            });
        }
        if scope.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "workspace.default_scope".into(),
                detail: "default scope must be a single name without '/'".into(),
            });
        }
        if crate::models::ComponentId::new(scope, "component").is_err() {
            return Err(ConfigError::InvalidValue {
                field: "workspace.default_scope".into(),
                detail: format!("'{scope}' is not a valid scope name"),
            });
        }
        if Path::new(&self.workspace.default_directory).is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "workspace.default_directory".into(),
                detail: "must be relative to the workspace root".into(),
            });
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.workspace.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "workspace.log_level".into(),
                detail: format!("unknown level '{}'", self.workspace.log_level),
            });
        }
        if self.write.staging_dir.is_empty() || Path::new(&self.write.staging_dir).is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "write.staging_dir".into(),
                detail: "must be a non-empty path relative to the workspace root".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[workspace]
default_scope = "my-scope"
"#
    }

    #[test]
    fn test_parse_minimal_config_uses_defaults() {
        let config: WorkspaceConfig = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.workspace.default_scope, "my-scope");
        assert_eq!(config.workspace.default_directory, "components");
        assert_eq!(config.workspace.log_level, "info");
        assert_eq!(config.merge.default_strategy, MergeStrategy::Manual);
        assert_eq!(config.write.staging_dir, ".scope/staging");
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[workspace]
default_scope = "remote"
default_directory = "libs"
log_level = "debug"

[merge]
default_strategy = "theirs"

[write]
staging_dir = "tmp/staging"
"#;
        let config: WorkspaceConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.workspace.default_directory, "libs");
        assert_eq!(config.merge.default_strategy, MergeStrategy::Theirs);
        assert_eq!(config.write.staging_dir, "tmp/staging");
    }

    #[test]
    fn test_unknown_strategy_fails_to_parse() {
        let toml_str = r#"
[workspace]
default_scope = "remote"

[merge]
default_strategy = "invalid"
"#;
        assert!(toml::from_str::<WorkspaceConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate_scope_name() {
        let mut config = WorkspaceConfig::new("remote");
        config.validate().unwrap();

        config.workspace.default_scope = String::new();
        assert!(config.validate().is_err());

        config.workspace.default_scope = "org/remote".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workspace.default_scope"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = WorkspaceConfig::new("remote");
        config.workspace.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = WorkspaceConfig::new("remote");
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(WorkspaceConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = WorkspaceConfig::load("/nonexistent/scopesync.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
