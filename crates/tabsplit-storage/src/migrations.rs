//! Database schema migrations.
//!
//! Turns the declarations in `schema` into tables, index columns and
//! multi-entry side tables, one schema version at a time. All pending steps
//! run in a single transaction, so a store is either fully migrated or left
//! at its previous version.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use tabsplit_core::error::{Result, TabsplitError};
use tabsplit_core::types::Settings;

use crate::schema::{CollectionDef, IndexDef, COLLECTIONS, SCHEMA_VERSION, SETTINGS};
use crate::tx::{Tx, TxMode};

/// Name recorded for each schema version.
const MIGRATIONS: &[(u32, &str)] = &[(1, "initial_collections"), (2, "template_usage_indexes")];

fn open_err(context: &'static str) -> impl Fn(rusqlite::Error) -> TabsplitError {
    move |e| TabsplitError::ConnectionFailure(format!("{}: {}", context, e))
}

/// Run all pending database migrations.
///
/// A fresh store also gets the default settings record. A store written by
/// a newer schema is refused with `VersionError`.
pub fn run_migrations(conn: &mut Connection, now: DateTime<Utc>) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(open_err("Failed to create migrations table"))?;

    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(TabsplitError::VersionError {
            stored: current,
            supported: SCHEMA_VERSION,
        });
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }

    let txn = conn
        .transaction()
        .map_err(open_err("Failed to begin migration"))?;

    for version in (current + 1)..=SCHEMA_VERSION {
        apply_version(&txn, version)?;
        let name = migration_name(version);
        txn.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![version, name, now.timestamp_millis()],
        )
        .map_err(open_err("Failed to record migration"))?;
        info!("Applied migration v{}: {}", version, name);
    }

    if current == 0 {
        let tx = Tx::new(&txn, TxMode::ReadWrite, vec![SETTINGS]);
        tx.add(&Settings::defaults(now))?;
    }

    txn.commit().map_err(open_err("Failed to commit migration"))?;
    Ok(())
}

/// Highest applied schema version, 0 for an empty store.
pub fn current_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(open_err("Failed to query migration version"))?;
    Ok(u32::try_from(version).unwrap_or(u32::MAX))
}

fn migration_name(version: u32) -> &'static str {
    MIGRATIONS
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, name)| *name)
        .unwrap_or("unnamed")
}

fn apply_version(conn: &Connection, version: u32) -> Result<()> {
    for def in COLLECTIONS {
        if def.since == version {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key     TEXT PRIMARY KEY NOT NULL,
                    doc     TEXT NOT NULL,
                    payload BLOB
                );",
                def.name
            ))
            .map_err(open_err("Failed to create collection"))?;
        }
        for ix in def.indexes.iter().filter(|ix| ix.since == version) {
            if ix.multi_entry {
                add_multi_entry_index(conn, def, ix)?;
            } else {
                add_column_index(conn, def, ix)?;
            }
        }
    }
    Ok(())
}

/// JSON path expression for a dotted key path.
fn json_path(key_path: &str) -> String {
    format!("$.{}", key_path)
}

/// Add an index column, fill it from stored documents, and index it.
///
/// Only scalars are indexed; booleans become 0/1 as on the write path.
fn add_column_index(conn: &Connection, def: &CollectionDef, ix: &IndexDef) -> Result<()> {
    let column = def.column(ix);
    let path = json_path(ix.key_path);
    let collate = if ix.nocase { " COLLATE NOCASE" } else { "" };

    conn.execute_batch(&format!(
        "ALTER TABLE {table} ADD COLUMN {column}{collate};

         UPDATE {table} SET {column} =
            CASE json_type(doc, '{path}')
                WHEN 'text' THEN json_extract(doc, '{path}')
                WHEN 'integer' THEN json_extract(doc, '{path}')
                WHEN 'real' THEN json_extract(doc, '{path}')
                WHEN 'true' THEN 1
                WHEN 'false' THEN 0
                ELSE NULL
            END;

         CREATE INDEX IF NOT EXISTS {index} ON {table} ({column}, key);",
        table = def.name,
        column = column,
        collate = collate,
        path = path,
        index = def.sql_index(ix),
    ))
    .map_err(open_err("Failed to add index column"))
}

/// Create a side table holding one row per array element, filled from
/// stored documents.
fn add_multi_entry_index(conn: &Connection, def: &CollectionDef, ix: &IndexDef) -> Result<()> {
    let side = def.side_table(ix);
    let path = json_path(ix.key_path);

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {side} (
            key   TEXT NOT NULL,
            value NOT NULL,
            PRIMARY KEY (key, value)
         ) WITHOUT ROWID;

         INSERT OR IGNORE INTO {side} (key, value)
            SELECT t.key,
                   CASE e.type WHEN 'true' THEN 1 WHEN 'false' THEN 0 ELSE e.value END
            FROM {table} t, json_each(t.doc, '{path}') e
            WHERE json_type(t.doc, '{path}') = 'array'
              AND e.type IN ('text', 'integer', 'real', 'true', 'false');

         CREATE INDEX IF NOT EXISTS {index} ON {side} (value, key);",
        side = side,
        table = def.name,
        path = path,
        index = def.sql_index(ix),
    ))
    .map_err(open_err("Failed to add multi-entry index"))
}
