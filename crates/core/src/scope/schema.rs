//! Scope schema definitions and migration runner.
//!
//! Migrations are plain SQL strings applied in order. The SQLite
//! `user_version` pragma records which ones have already run.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order: `(version, description, sql)`. Versions start
/// at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial scope schema",
        r#"
        CREATE TABLE IF NOT EXISTS components (
            full_name       TEXT PRIMARY KEY,
            scope           TEXT NOT NULL,
            name            TEXT NOT NULL,
            head            TEXT,
            exported_head   TEXT
        );

        CREATE TABLE IF NOT EXISTS versions (
            id              TEXT PRIMARY KEY,
            component       TEXT NOT NULL,
            tag             TEXT NOT NULL,
            content_hash    TEXT NOT NULL,
            message         TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_versions_component ON versions (component);
        CREATE INDEX IF NOT EXISTS idx_versions_component_tag ON versions (component, tag);

        CREATE TABLE IF NOT EXISTS version_parents (
            version_id      TEXT NOT NULL,
            position        INTEGER NOT NULL,
            parent_id       TEXT NOT NULL,
            PRIMARY KEY (version_id, position)
        );

        CREATE TABLE IF NOT EXISTS objects (
            hash            TEXT PRIMARY KEY,
            content         BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS remotes (
            name            TEXT PRIMARY KEY,
            location        TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "key-value scope state",
        r#"
        CREATE TABLE IF NOT EXISTS kv_state (
            key             TEXT PRIMARY KEY,
            value           TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking scope migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
