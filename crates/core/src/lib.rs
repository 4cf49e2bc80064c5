//! scopesync core library.
//!
//! This crate provides the foundations for component-level version control:
//! version ledgers and divergence detection, three-way merging, the
//! workspace map and its reconciliation, collision-safe batch writes, remote
//! action dispatch, and the engine that ties them into workspace operations.

pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod fsutil;
pub mod ledger;
pub mod models;
pub mod remote;
pub mod scope;
pub mod workspace;
pub mod writer;

// Re-exports for convenience.
pub use config::WorkspaceConfig;
pub use conflict::{ConflictDetector, MergeEngine, MergeStrategy};
pub use engine::{Engine, ExportOptions, ImportOptions, TagOptions};
pub use errors::CoreError;
pub use ledger::{Version, VersionId, VersionLedger};
pub use models::ComponentId;
pub use remote::RemoteActionDispatcher;
pub use scope::Scope;
pub use workspace::WorkspaceMap;
pub use writer::WriteCoordinator;
