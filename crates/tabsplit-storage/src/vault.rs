//! One entry point wiring every repository and service around a shared
//! gateway.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use tabsplit_core::clock::Clock;
use tabsplit_core::config::{StorageConfig, TabsplitConfig};
use tabsplit_core::error::Result;
use tabsplit_core::events::{EventKind, ListenerId, StorageEvent};

use crate::gateway::{DatabaseTarget, Gateway};
use crate::queries::QueryService;
use crate::repository::{CalculationRepository, ImageRepository};
use crate::retention::RetentionManager;
use crate::settings::SettingsRepository;
use crate::template::TemplateRepository;
use crate::transfer::TransferService;

/// The store as seen by an application.
///
/// Cheap to clone; every clone shares the same connection and event bus.
/// The database is opened on first use.
#[derive(Debug, Clone)]
pub struct Vault {
    gateway: Arc<Gateway>,
}

impl Vault {
    /// A store backed by the file at `path`.
    pub fn open(path: impl Into<PathBuf>, config: StorageConfig) -> Self {
        Self::from_gateway(Gateway::new(DatabaseTarget::File(path.into()), config))
    }

    /// A private in-memory store.
    pub fn in_memory(config: StorageConfig) -> Self {
        Self::from_gateway(Gateway::new(DatabaseTarget::Memory, config))
    }

    /// A store at the database path named by the application config.
    pub fn from_config(config: &TabsplitConfig) -> Self {
        Self::open(config.database_path(), config.storage.clone())
    }

    /// Like `open`/`in_memory`, with timestamps taken from `clock`.
    pub fn with_clock(target: DatabaseTarget, config: StorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self::from_gateway(Gateway::with_clock(target, config, clock))
    }

    pub fn from_gateway(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Open the database now instead of on first use.
    pub async fn connect(&self) -> Result<()> {
        self.gateway.connect().await
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn calculations(&self) -> CalculationRepository {
        CalculationRepository::new(Arc::clone(&self.gateway))
    }

    pub fn images(&self) -> ImageRepository {
        ImageRepository::new(Arc::clone(&self.gateway))
    }

    pub fn templates(&self) -> TemplateRepository {
        TemplateRepository::new(Arc::clone(&self.gateway))
    }

    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(Arc::clone(&self.gateway))
    }

    pub fn queries(&self) -> QueryService {
        QueryService::new(Arc::clone(&self.gateway))
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(Arc::clone(&self.gateway))
    }

    pub fn transfer(&self) -> TransferService {
        TransferService::new(Arc::clone(&self.gateway))
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        self.gateway.events().subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        self.gateway.events().unsubscribe(kind, id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<StorageEvent> {
        self.gateway.events().subscribe_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{CalculationQuery, CalculationSortField, SortDirection};
    use tabsplit_core::error::TabsplitError;
    use tabsplit_core::types::{NewCalculation, NewImage};

    fn dinner() -> NewCalculation {
        NewCalculation {
            name: "Dinner".to_string(),
            images: [500, 800]
                .into_iter()
                .map(|bytes| NewImage {
                    name: format!("{bytes}.jpg"),
                    mime_type: "image/jpeg".to_string(),
                    data: vec![0; bytes],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dinner_scenario_stats() {
        let vault = Vault::in_memory(StorageConfig::default());
        vault.calculations().create(dinner()).await.unwrap();

        let stats = vault.queries().storage_stats().await.unwrap();
        assert_eq!(stats.total_calculations, 1);
        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.total_size, 1300);
    }

    #[tokio::test]
    async fn test_clones_share_store_and_events() {
        let vault = Vault::in_memory(StorageConfig::default());
        let other = vault.clone();
        let mut rx = vault.subscribe_all();

        let id = other.calculations().create(dinner()).await.unwrap();
        assert!(vault.calculations().get(&id).await.unwrap().is_some());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::CalculationCreated);
    }

    #[tokio::test]
    async fn test_unsubscribe_through_vault() {
        let vault = Vault::in_memory(StorageConfig::default());
        let id = vault.subscribe(EventKind::CalculationCreated, |_| {});
        assert!(vault.unsubscribe(EventKind::CalculationCreated, id));
        assert!(!vault.unsubscribe(EventKind::CalculationCreated, id));
    }

    #[tokio::test]
    async fn test_reopen_file_store_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        let id = {
            let vault = Vault::open(&path, StorageConfig::default());
            vault.calculations().create(dinner()).await.unwrap()
        };

        let reopened = Vault::open(&path, StorageConfig::default());
        let found = reopened
            .calculations()
            .query(CalculationQuery {
                sort: Some((CalculationSortField::CreatedAt, SortDirection::Desc)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[tokio::test]
    async fn test_newer_file_store_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        Vault::open(&path, StorageConfig::default()).connect().await.unwrap();

        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (99, 'future', 0)",
                [],
            )
            .unwrap();
        }

        let err = Vault::open(&path, StorageConfig::default())
            .calculations()
            .count()
            .await
            .unwrap_err();
        assert!(matches!(err, TabsplitError::VersionError { stored: 99, .. }));
    }
}
