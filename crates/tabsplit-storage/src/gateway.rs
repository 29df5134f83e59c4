//! The shared handle every repository goes through.
//!
//! `Gateway` opens the database lazily on first use, runs transaction
//! closures on the blocking pool, and owns the event bus and the clock that
//! stamps records. Share it as `Arc<Gateway>`; dropping the last handle
//! closes the connection.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use tabsplit_core::clock::{Clock, MonotonicClock, SystemClock};
use tabsplit_core::config::StorageConfig;
use tabsplit_core::error::{Result, TabsplitError};
use tabsplit_core::events::{EventBus, StorageEvent};

use crate::db::Database;
use crate::tx::{Tx, TxMode};

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    File(PathBuf),
    Memory,
}

pub struct Gateway {
    target: DatabaseTarget,
    config: StorageConfig,
    db: OnceCell<Arc<Database>>,
    events: Arc<EventBus>,
    clock: MonotonicClock,
}

impl Gateway {
    pub fn new(target: DatabaseTarget, config: StorageConfig) -> Arc<Self> {
        Self::with_clock(target, config, Arc::new(SystemClock))
    }

    /// Build a gateway whose timestamps come from `clock`.
    pub fn with_clock(
        target: DatabaseTarget,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        Arc::new(Self {
            target,
            config,
            db: OnceCell::new(),
            events,
            clock: MonotonicClock::new(clock),
        })
    }

    /// Open and migrate the database if that has not happened yet.
    ///
    /// Concurrent callers wait on the same initialization. A failed open is
    /// not cached; the next call tries again.
    pub async fn connect(&self) -> Result<()> {
        self.database().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.db.initialized()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Next timestamp; strictly later than every previous one.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn emit(&self, event: StorageEvent) {
        self.events.emit(event);
    }

    /// Run `f` in a read-only transaction over `scope`.
    pub async fn read<F, T>(&self, scope: &[&'static str], f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(TxMode::ReadOnly, scope, f).await
    }

    /// Run `f` in a read-write transaction over `scope`. Everything `f`
    /// wrote is committed when it returns `Ok` and discarded otherwise.
    pub async fn write<F, T>(&self, scope: &[&'static str], f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(TxMode::ReadWrite, scope, f).await
    }

    /// Bytes allocated by the database.
    pub async fn database_size(&self) -> Result<u64> {
        self.read(&[], |tx| tx.database_size()).await
    }

    async fn run<F, T>(&self, mode: TxMode, scope: &[&'static str], f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.database().await?;
        let sizing = Arc::clone(&db);
        let scope = scope.to_vec();
        debug!(?mode, ?scope, "Running transaction");

        let result = tokio::task::spawn_blocking(move || db.transaction(mode, scope, f))
            .await
            .map_err(|e| TabsplitError::Storage(format!("Transaction task failed: {}", e)))?;

        let rejected = match &result {
            Err(TabsplitError::QuotaExceeded(message)) => Some(message.clone()),
            _ => None,
        };
        if let Some(message) = rejected {
            warn!(%message, "Write rejected by storage quota");
            let used_bytes = tokio::task::spawn_blocking(move || {
                sizing.transaction(TxMode::ReadOnly, Vec::new(), |tx| tx.database_size())
            })
            .await
            .ok()
            .and_then(|size| size.ok())
            .unwrap_or(0);
            self.emit(StorageEvent::StorageQuotaWarning {
                used_bytes,
                quota_bytes: self.config.quota_bytes(),
                message,
                timestamp: self.now(),
            });
        }
        result
    }

    async fn database(&self) -> Result<Arc<Database>> {
        let db = self
            .db
            .get_or_try_init(|| async {
                let target = self.target.clone();
                let config = self.config.clone();
                let now = self.clock.now();
                let opened = tokio::task::spawn_blocking(move || match &target {
                    DatabaseTarget::File(path) => Database::open(path, &config, now),
                    DatabaseTarget::Memory => Database::in_memory(&config, now),
                })
                .await
                .map_err(|e| TabsplitError::ConnectionFailure(format!("Open task failed: {}", e)))?;

                match opened {
                    Ok(db) => Ok(Arc::new(db)),
                    Err(e) => {
                        error!(error = %e, "Failed to open store");
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(Arc::clone(db))
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .finish()
    }
}
