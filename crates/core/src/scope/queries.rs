//! Typed query helpers for every table in a scope database.
//!
//! The free functions take a `&Connection` so they compose inside
//! [`Scope::transaction`]; the methods on [`Scope`] lock the connection and
//! delegate to them.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{blob_hash, encode_manifest, tree_manifest, Scope};
use crate::errors::DatabaseError;
use crate::ledger::{Version, VersionId, VersionLedger};
use crate::models::FileTree;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A row from the `components` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRecord {
    pub full_name: String,
    pub scope: String,
    pub name: String,
    pub head: Option<VersionId>,
    /// Last head known to be on the remote.
    pub exported_head: Option<VersionId>,
}

/// A row from the `remotes` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub name: String,
    pub location: String,
}

/// Head pointers to move while ingesting. `None` leaves a pointer as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadUpdate {
    pub component: String,
    pub head: Option<VersionId>,
    pub exported_head: Option<VersionId>,
}

/// Versions, objects and head moves applied together by [`Scope::ingest`].
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub versions: Vec<Version>,
    pub objects: Vec<(String, Vec<u8>)>,
    pub heads: Vec<HeadUpdate>,
}

impl IngestBatch {
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.objects.is_empty() && self.heads.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers
// ---------------------------------------------------------------------------

fn parse_id(raw: Option<String>) -> Option<VersionId> {
    raw.filter(|s| !s.is_empty()).map(VersionId::new)
}

/// Insert the component row if it does not exist yet.
pub fn ensure_component(conn: &Connection, full_name: &str) -> Result<(), DatabaseError> {
    let (scope, name) = full_name.split_once('/').unwrap_or(("", full_name));
    conn.execute(
        "INSERT OR IGNORE INTO components (full_name, scope, name) VALUES (?1, ?2, ?3)",
        params![full_name, scope, name],
    )?;
    Ok(())
}

pub fn put_object(conn: &Connection, hash: &str, content: &[u8]) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO objects (hash, content) VALUES (?1, ?2)",
        params![hash, content],
    )?;
    Ok(())
}

pub fn get_object(conn: &Connection, hash: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
    let content = conn
        .query_row(
            "SELECT content FROM objects WHERE hash = ?1",
            params![hash],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(content)
}

/// Store every blob of `tree` plus its manifest; returns the tree hash.
pub fn put_tree(conn: &Connection, tree: &FileTree) -> Result<String, DatabaseError> {
    for content in tree.values() {
        put_object(conn, &blob_hash(content), content)?;
    }
    let manifest = encode_manifest(&tree_manifest(tree));
    let hash = blob_hash(&manifest);
    put_object(conn, &hash, &manifest)?;
    Ok(hash)
}

/// Decode a tree manifest object.
pub fn read_manifest(
    conn: &Connection,
    tree_hash: &str,
) -> Result<BTreeMap<String, String>, DatabaseError> {
    let raw = get_object(conn, tree_hash)?.ok_or_else(|| DatabaseError::NotFound {
        entity: "tree".into(),
        id: tree_hash.to_string(),
    })?;
    serde_json::from_slice(&raw).map_err(|e| DatabaseError::Corrupt {
        entity: "tree".into(),
        id: tree_hash.to_string(),
        detail: e.to_string(),
    })
}

/// Load the full file tree behind `tree_hash`.
pub fn read_tree(conn: &Connection, tree_hash: &str) -> Result<FileTree, DatabaseError> {
    let mut tree = FileTree::new();
    for (path, hash) in read_manifest(conn, tree_hash)? {
        let content = get_object(conn, &hash)?.ok_or_else(|| DatabaseError::NotFound {
            entity: "blob".into(),
            id: hash.clone(),
        })?;
        tree.insert(path, content);
    }
    Ok(tree)
}

/// Insert a version and its parent links. Existing versions are left alone.
pub fn insert_version(conn: &Connection, version: &Version) -> Result<(), DatabaseError> {
    ensure_component(conn, &version.component)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO versions (id, component, tag, content_hash, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            version.id.as_str(),
            version.component,
            version.tag,
            version.content_hash,
            version.message,
            version.created_at.to_rfc3339(),
        ],
    )?;
    if inserted > 0 {
        for (position, parent) in version.parents.iter().enumerate() {
            conn.execute(
                "INSERT INTO version_parents (version_id, position, parent_id) VALUES (?1, ?2, ?3)",
                params![version.id.as_str(), position as i64, parent.as_str()],
            )?;
        }
        debug!(component = %version.component, tag = %version.tag, id = version.id.short(), "stored version");
    }
    Ok(())
}

pub fn set_head(conn: &Connection, full_name: &str, head: &VersionId) -> Result<(), DatabaseError> {
    ensure_component(conn, full_name)?;
    conn.execute(
        "UPDATE components SET head = ?2 WHERE full_name = ?1",
        params![full_name, head.as_str()],
    )?;
    Ok(())
}

pub fn set_exported_head(
    conn: &Connection,
    full_name: &str,
    head: &VersionId,
) -> Result<(), DatabaseError> {
    ensure_component(conn, full_name)?;
    conn.execute(
        "UPDATE components SET exported_head = ?2 WHERE full_name = ?1",
        params![full_name, head.as_str()],
    )?;
    Ok(())
}

pub fn get_component(
    conn: &Connection,
    full_name: &str,
) -> Result<Option<ComponentRecord>, DatabaseError> {
    let record = conn
        .query_row(
            "SELECT full_name, scope, name, head, exported_head FROM components WHERE full_name = ?1",
            params![full_name],
            component_from_row,
        )
        .optional()?;
    Ok(record)
}

pub fn list_components(conn: &Connection) -> Result<Vec<ComponentRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT full_name, scope, name, head, exported_head FROM components ORDER BY full_name",
    )?;
    let records = stmt
        .query_map([], component_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn component_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ComponentRecord> {
    Ok(ComponentRecord {
        full_name: row.get(0)?,
        scope: row.get(1)?,
        name: row.get(2)?,
        head: parse_id(row.get(3)?),
        exported_head: parse_id(row.get(4)?),
    })
}

/// Rebuild the ledger of one component, or `None` if the scope has never
/// recorded it.
pub fn load_ledger(
    conn: &Connection,
    full_name: &str,
) -> Result<Option<VersionLedger>, DatabaseError> {
    let Some(record) = get_component(conn, full_name)? else {
        return Ok(None);
    };

    let mut parents: HashMap<String, Vec<VersionId>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT p.version_id, p.parent_id FROM version_parents p
             JOIN versions v ON v.id = p.version_id
             WHERE v.component = ?1 ORDER BY p.version_id, p.position",
        )?;
        let rows = stmt.query_map(params![full_name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (child, parent) = row?;
            parents.entry(child).or_default().push(VersionId::new(parent));
        }
    }

    let mut stmt = conn.prepare(
        "SELECT id, tag, content_hash, message, created_at FROM versions WHERE component = ?1",
    )?;
    let rows = stmt
        .query_map(params![full_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut versions = Vec::with_capacity(rows.len());
    for (id, tag, content_hash, message, created_at) in rows {
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| DatabaseError::Corrupt {
                entity: "version".into(),
                id: id.clone(),
                detail: e.to_string(),
            })?;
        versions.push(Version {
            parents: parents.remove(&id).unwrap_or_default(),
            id: VersionId::new(id),
            component: full_name.to_string(),
            tag,
            content_hash,
            message,
            created_at,
        });
    }

    Ok(Some(VersionLedger::from_parts(full_name, record.head, versions)))
}

// ---------------------------------------------------------------------------
// Scope methods
// ---------------------------------------------------------------------------

impl Scope {
    // -- objects ------------------------------------------------------------

    pub fn get_object(&self, hash: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        get_object(&self.conn(), hash)
    }

    pub fn put_tree(&self, tree: &FileTree) -> Result<String, DatabaseError> {
        self.transaction(|conn| put_tree(conn, tree))
    }

    pub fn read_tree(&self, tree_hash: &str) -> Result<FileTree, DatabaseError> {
        read_tree(&self.conn(), tree_hash)
    }

    /// The manifest object of `tree_hash` plus every blob it references, as
    /// `(hash, content)` pairs.
    pub fn tree_objects(&self, tree_hash: &str) -> Result<Vec<(String, Vec<u8>)>, DatabaseError> {
        let conn = self.conn();
        let manifest = read_manifest(&conn, tree_hash)?;
        let mut out = Vec::with_capacity(manifest.len() + 1);
        for hash in std::iter::once(tree_hash).chain(manifest.values().map(String::as_str)) {
            let content = get_object(&conn, hash)?.ok_or_else(|| DatabaseError::NotFound {
                entity: "object".into(),
                id: hash.to_string(),
            })?;
            out.push((hash.to_string(), content));
        }
        Ok(out)
    }

    // -- components and ledgers ---------------------------------------------

    pub fn get_component(&self, full_name: &str) -> Result<Option<ComponentRecord>, DatabaseError> {
        get_component(&self.conn(), full_name)
    }

    pub fn list_components(&self) -> Result<Vec<ComponentRecord>, DatabaseError> {
        list_components(&self.conn())
    }

    pub fn load_ledger(&self, full_name: &str) -> Result<Option<VersionLedger>, DatabaseError> {
        load_ledger(&self.conn(), full_name)
    }

    pub fn set_exported_head(&self, full_name: &str, head: &VersionId) -> Result<(), DatabaseError> {
        set_exported_head(&self.conn(), full_name, head)
    }

    /// Forget a component and its versions. Objects are kept; they may be
    /// shared with other components.
    pub fn remove_component(&self, full_name: &str) -> Result<bool, DatabaseError> {
        self.transaction(|conn| {
            conn.execute(
                "DELETE FROM version_parents WHERE version_id IN
                 (SELECT id FROM versions WHERE component = ?1)",
                params![full_name],
            )?;
            conn.execute("DELETE FROM versions WHERE component = ?1", params![full_name])?;
            let removed = conn.execute(
                "DELETE FROM components WHERE full_name = ?1",
                params![full_name],
            )?;
            debug!(component = full_name, removed, "removed component from scope");
            Ok(removed > 0)
        })
    }

    /// Apply a batch of foreign versions, objects and head moves in one
    /// transaction.
    pub fn ingest(&self, batch: &IngestBatch) -> Result<(), DatabaseError> {
        self.transaction(|conn| {
            for (hash, content) in &batch.objects {
                put_object(conn, hash, content)?;
            }
            for version in &batch.versions {
                insert_version(conn, version)?;
            }
            for update in &batch.heads {
                ensure_component(conn, &update.component)?;
                if let Some(head) = &update.head {
                    set_head(conn, &update.component, head)?;
                }
                if let Some(exported) = &update.exported_head {
                    set_exported_head(conn, &update.component, exported)?;
                }
            }
            debug!(
                versions = batch.versions.len(),
                objects = batch.objects.len(),
                heads = batch.heads.len(),
                "ingested batch"
            );
            Ok(())
        })
    }

    // -- remotes ------------------------------------------------------------

    /// Add or replace a remote.
    pub fn add_remote(&self, name: &str, location: &str) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO remotes (name, location) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET location = excluded.location",
            params![name, location],
        )?;
        debug!(name, location, "set remote");
        Ok(())
    }

    pub fn remove_remote(&self, name: &str) -> Result<bool, DatabaseError> {
        let removed = self
            .conn()
            .execute("DELETE FROM remotes WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    pub fn remotes(&self) -> Result<Vec<RemoteRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name, location FROM remotes ORDER BY name")?;
        let remotes = stmt
            .query_map([], |row| {
                Ok(RemoteRecord {
                    name: row.get(0)?,
                    location: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(remotes)
    }

    /// Location of the remote called `name`, if configured.
    pub fn resolve_remote(&self, name: &str) -> Result<Option<String>, DatabaseError> {
        let location = self
            .conn()
            .query_row(
                "SELECT location FROM remotes WHERE name = ?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(location)
    }

    // -- kv_state -----------------------------------------------------------

    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }
}
