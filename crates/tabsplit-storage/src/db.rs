//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode, the busy timeout and the size quota on open, then
//! brings the schema up to date.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use tracing::{debug, info, warn};

use tabsplit_core::config::StorageConfig;
use tabsplit_core::error::{Result, TabsplitError};

use crate::migrations;
use crate::tx::{Tx, TxMode};

/// Map a rusqlite error into the store's error type.
///
/// A full database is reported as `QuotaExceeded`; everything else is a
/// generic storage error carrying `context`.
pub(crate) fn sql_err(context: &'static str) -> impl Fn(rusqlite::Error) -> TabsplitError {
    move |e| match e.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => TabsplitError::QuotaExceeded(format!("{}: {}", context, e)),
        _ => TabsplitError::Storage(format!("{}: {}", context, e)),
    }
}

/// Thread-safe SQLite database wrapper.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path and run pending
    /// migrations. `now` stamps records seeded by the first migration.
    pub fn open(path: &Path, config: &StorageConfig, now: DateTime<Utc>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TabsplitError::ConnectionFailure(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            TabsplitError::ConnectionFailure(format!("Failed to open database: {}", e))
        })?;
        let db = Self::configure(conn, config, now)?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(config: &StorageConfig, now: DateTime<Utc>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            TabsplitError::ConnectionFailure(format!("Failed to open in-memory db: {}", e))
        })?;
        Self::configure(conn, config, now)
    }

    fn configure(mut conn: Connection, config: &StorageConfig, now: DateTime<Utc>) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| TabsplitError::ConnectionFailure(format!("Failed to set pragmas: {}", e)))?;

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|e| {
                TabsplitError::ConnectionFailure(format!("Failed to set busy timeout: {}", e))
            })?;

        migrations::run_migrations(&mut conn, now)?;

        if let Some(quota) = config.quota_bytes() {
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(|e| {
                    TabsplitError::ConnectionFailure(format!("Failed to read page size: {}", e))
                })?;
            let max_pages = (quota / page_size.max(1) as u64).max(1);
            // SQLite never lowers the limit below the current page count.
            let applied: i64 = conn
                .query_row(&format!("PRAGMA max_page_count = {}", max_pages), [], |row| {
                    row.get(0)
                })
                .map_err(|e| {
                    TabsplitError::ConnectionFailure(format!("Failed to apply quota: {}", e))
                })?;
            debug!(quota_bytes = quota, max_pages = applied, "Storage quota applied");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Execute a closure with the underlying connection.
    ///
    /// The mutex is held for the duration of the closure. A lock poisoned by
    /// a panicking closure is taken over: unwinding dropped its open
    /// transaction, which rolled it back.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database lock poisoned by a panicked transaction, recovering");
            poisoned.into_inner()
        });
        f(&mut conn)
    }

    /// Run `f` inside one SQLite transaction limited to `scope`.
    ///
    /// The transaction commits when `f` returns `Ok`; on `Err` (or a failed
    /// commit) nothing it wrote is kept. Write transactions take the write
    /// lock up front so two writers never interleave.
    pub fn transaction<F, T>(&self, mode: TxMode, scope: Vec<&'static str>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        self.with_conn(|conn| {
            let behavior = match mode {
                TxMode::ReadOnly => TransactionBehavior::Deferred,
                TxMode::ReadWrite => TransactionBehavior::Immediate,
            };
            let txn = conn
                .transaction_with_behavior(behavior)
                .map_err(sql_err("Failed to begin transaction"))?;

            let value = {
                let mut tx = Tx::new(&txn, mode, scope);
                f(&mut tx)?
            };

            txn.commit().map_err(sql_err("Failed to commit transaction"))?;
            Ok(value)
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SETTINGS;
    use tabsplit_core::types::{Settings, SETTINGS_KEY};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_in_memory_database_is_seeded() {
        let db = Database::in_memory(&StorageConfig::default(), now()).unwrap();
        let settings = db
            .transaction(TxMode::ReadOnly, vec![SETTINGS], |tx| {
                tx.get::<Settings>(SETTINGS_KEY)
            })
            .unwrap()
            .unwrap();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.created_at, now());
    }

    #[test]
    fn test_panicked_transaction_is_rolled_back_and_lock_recovered() {
        let db = Database::in_memory(&StorageConfig::default(), now()).unwrap();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            db.transaction(TxMode::ReadWrite, vec![SETTINGS], |tx| -> Result<()> {
                let mut settings = tx.get::<Settings>(SETTINGS_KEY)?.unwrap();
                settings.version = 99;
                tx.put(&settings)?;
                panic!("closure failed mid-transaction");
            })
        }));
        assert!(outcome.is_err());

        let settings = db
            .transaction(TxMode::ReadOnly, vec![SETTINGS], |tx| {
                tx.get::<Settings>(SETTINGS_KEY)
            })
            .unwrap()
            .unwrap();
        assert_eq!(settings.version, 1);
    }

    #[test]
    fn test_file_database_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let db = Database::open(&path, &StorageConfig::default(), now()).unwrap();
        assert!(path.exists());

        let mode: String = db
            .with_conn(|conn| {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(|e| TabsplitError::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_quota_sets_max_page_count() {
        let config = StorageConfig {
            quota_kb: 1024,
            ..Default::default()
        };
        let db = Database::in_memory(&config, now()).unwrap();
        let (pages, page_size): (i64, i64) = db
            .with_conn(|conn| {
                let pages = conn
                    .query_row("PRAGMA max_page_count", [], |row| row.get(0))
                    .map_err(|e| TabsplitError::Storage(e.to_string()))?;
                let size = conn
                    .query_row("PRAGMA page_size", [], |row| row.get(0))
                    .map_err(|e| TabsplitError::Storage(e.to_string()))?;
                Ok((pages, size))
            })
            .unwrap();
        assert_eq!(pages * page_size, 1024 * 1024);
    }

    #[test]
    fn test_sql_err_maps_disk_full_to_quota() {
        let full = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        assert!(matches!(
            sql_err("insert")(full),
            TabsplitError::QuotaExceeded(_)
        ));

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(sql_err("insert")(busy), TabsplitError::Storage(_)));
    }
}
