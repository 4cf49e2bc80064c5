//! SQLite-backed scope storage.
//!
//! A [`Scope`] owns the version ledgers of its components, a
//! content-addressable object store and the list of configured remotes. The
//! workspace keeps one under `.scope/`; a remote scope is a bare directory
//! holding only the database file.

pub mod queries;
pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::DatabaseError;
use crate::models::FileTree;

pub use queries::{ComponentRecord, HeadUpdate, IngestBatch, RemoteRecord};

/// File name of the scope database inside a scope directory.
pub const SCOPE_DB_FILE: &str = "scope.db";

/// kv_state key holding the scope's own name.
const NAME_KEY: &str = "scope_name";

/// Handle to one scope database.
///
/// The connection sits behind a `Mutex` so a `Scope` is `Send + Sync`.
pub struct Scope {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Scope {
    /// Create (or reopen) the scope in `dir`, recording `name` as its name.
    pub fn init<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self, DatabaseError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let scope = Self::connect(dir)?;
        if scope.get_state(NAME_KEY)?.is_none() {
            scope.set_state(NAME_KEY, name)?;
        }
        info!(path = %dir.display(), name, "initialized scope");
        Ok(scope)
    }

    /// Open an existing scope directory. Fails if it holds no scope database.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DatabaseError> {
        let dir = dir.as_ref();
        if !dir.join(SCOPE_DB_FILE).is_file() {
            return Err(DatabaseError::NotFound {
                entity: "scope".into(),
                id: dir.display().to_string(),
            });
        }
        Self::connect(dir)
    }

    /// An in-memory scope (useful for testing).
    pub fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        let scope = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        scope.set_state(NAME_KEY, name)?;
        Ok(scope)
    }

    fn connect(dir: &Path) -> Result<Self, DatabaseError> {
        let path = dir.join(SCOPE_DB_FILE);
        debug!(path = %path.display(), "opening scope database");
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(dir.to_path_buf()),
        })
    }

    /// Directory of the scope, `None` for in-memory scopes.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The scope's own name.
    pub fn name(&self) -> Result<String, DatabaseError> {
        Ok(self.get_state(NAME_KEY)?.unwrap_or_default())
    }

    /// Lock the underlying connection, recovering from a poisoned mutex.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("scope mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` inside a SQLite transaction: committed on `Ok`, rolled back
    /// otherwise.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// SHA-256 over every `(component, head)` pair, in name order. Changes
    /// whenever any head moves or a component appears or disappears.
    pub fn fingerprint(&self) -> Result<String, DatabaseError> {
        let mut hasher = Sha256::new();
        for record in self.list_components()? {
            hasher.update(record.full_name.as_bytes());
            hasher.update([0]);
            if let Some(head) = &record.head {
                hasher.update(head.as_str().as_bytes());
            }
            hasher.update([0]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// Content addressing
// ---------------------------------------------------------------------------

/// Object key of a file blob.
pub fn blob_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// The `{path: blob_hash}` manifest of a tree, in path order.
pub fn tree_manifest(tree: &FileTree) -> BTreeMap<String, String> {
    tree.iter()
        .map(|(path, content)| (path.clone(), blob_hash(content)))
        .collect()
}

/// Canonical JSON encoding of a tree manifest.
pub fn encode_manifest(manifest: &BTreeMap<String, String>) -> Vec<u8> {
    // A map of strings always serializes.
    serde_json::to_vec(manifest).unwrap_or_default()
}

/// Hash of a tree object, i.e. a version's `content_hash`.
pub fn tree_hash(tree: &FileTree) -> String {
    blob_hash(&encode_manifest(&tree_manifest(tree)))
}
