//! Database schema migrations

use crate::{Error, Result};
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 2;

/// Name of the commit counter row in `store_meta`
pub(crate) const COMMIT_SEQ: &str = "commit_seq";

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::debug!(
        "Running migrations: current_version={}, target_version={}",
        current_version,
        SCHEMA_VERSION
    );

    if current_version > SCHEMA_VERSION {
        return Err(Error::Migration(format!(
            "store schema {} is newer than supported {}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version != SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Schema version recorded in the store, 0 for a fresh file
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let has_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(0);
    }
    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tracing::debug!("Schema version set to {}", version);
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;
        CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);

        CREATE TABLE documents (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            data BLOB NOT NULL,
            metadata BLOB,
            PRIMARY KEY (collection, key)
        ) WITHOUT ROWID;

        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;
        "#,
    )
    .map_err(|e| Error::Migration(format!("v1: {}", e)))
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;
        CREATE TABLE store_meta (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        INSERT INTO store_meta (name, value) VALUES ('commit_seq', 0);

        INSERT INTO schema_version (version) VALUES (2);
        COMMIT;
        "#,
    )
    .map_err(|e| Error::Migration(format!("v2: {}", e)))
}
