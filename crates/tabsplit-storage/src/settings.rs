//! Repository for the settings singleton.

use std::sync::Arc;

use tracing::{info, warn};

use tabsplit_core::error::Result;
use tabsplit_core::events::StorageEvent;
use tabsplit_core::types::{Settings, SettingsPatch, SETTINGS_KEY};

use crate::gateway::Gateway;
use crate::schema::SETTINGS;
use crate::tx::Tx;

/// Load the singleton, writing the defaults first if it is missing.
pub(crate) fn load_or_init(tx: &Tx<'_>, now: chrono::DateTime<chrono::Utc>) -> Result<Settings> {
    if let Some(settings) = tx.get::<Settings>(SETTINGS_KEY)? {
        return Ok(settings);
    }
    let defaults = Settings::defaults(now);
    tx.put(&defaults)?;
    Ok(defaults)
}

pub struct SettingsRepository {
    gateway: Arc<Gateway>,
}

impl SettingsRepository {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Current settings. Never fails: if the store cannot be read the
    /// defaults are returned instead.
    pub async fn get(&self) -> Settings {
        let now = self.gateway.now();
        match self
            .gateway
            .write(&[SETTINGS], move |tx| load_or_init(tx, now))
            .await
        {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to load settings, using defaults");
                Settings::defaults(now)
            }
        }
    }

    /// Replace the sections present in `patch`.
    pub async fn update(&self, patch: SettingsPatch) -> Result<Settings> {
        let now = self.gateway.now();
        let settings = self
            .gateway
            .write(&[SETTINGS], move |tx| {
                let mut settings = load_or_init(tx, now)?;
                settings.apply(patch);
                settings.version += 1;
                settings.updated_at = now.max(settings.created_at);
                tx.put(&settings)?;
                Ok(settings)
            })
            .await?;

        info!(version = settings.version, "Settings updated");
        self.emit_updated(&settings);
        Ok(settings)
    }

    /// Restore every section to its default, keeping `createdAt` and
    /// continuing the version sequence.
    pub async fn reset(&self) -> Result<Settings> {
        let now = self.gateway.now();
        let settings = self
            .gateway
            .write(&[SETTINGS], move |tx| {
                let current = load_or_init(tx, now)?;
                let settings = Settings {
                    version: current.version + 1,
                    created_at: current.created_at,
                    updated_at: now.max(current.created_at),
                    ..Settings::defaults(now)
                };
                tx.put(&settings)?;
                Ok(settings)
            })
            .await?;

        info!(version = settings.version, "Settings reset to defaults");
        self.emit_updated(&settings);
        Ok(settings)
    }

    fn emit_updated(&self, settings: &Settings) {
        self.gateway.emit(StorageEvent::SettingsUpdated {
            version: settings.version,
            timestamp: self.gateway.now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DatabaseTarget;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabsplit_core::config::StorageConfig;
    use tabsplit_core::events::EventKind;
    use tabsplit_core::types::{RetentionPolicy, UiSettings};

    fn make_repo() -> (Arc<Gateway>, SettingsRepository) {
        let gateway = Gateway::new(DatabaseTarget::Memory, StorageConfig::default());
        (Arc::clone(&gateway), SettingsRepository::new(gateway))
    }

    #[tokio::test]
    async fn test_get_returns_seeded_defaults() {
        let (_, repo) = make_repo();
        let settings = repo.get().await;
        assert_eq!(settings.id, SETTINGS_KEY);
        assert_eq!(settings.version, 1);
        assert_eq!(settings.general.currency, "USD");
    }

    #[tokio::test]
    async fn test_get_recreates_missing_record() {
        let (gateway, repo) = make_repo();
        gateway
            .write(&[SETTINGS], |tx| tx.clear::<Settings>())
            .await
            .unwrap();

        let settings = repo.get().await;
        assert_eq!(settings.version, 1);
        let stored = gateway
            .read(&[SETTINGS], |tx| tx.count::<Settings>())
            .await
            .unwrap();
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn test_get_falls_back_when_store_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let gateway = Gateway::new(
            DatabaseTarget::File(blocker.join("store.db")),
            StorageConfig::default(),
        );

        let settings = SettingsRepository::new(gateway).get().await;
        assert_eq!(settings.storage, RetentionPolicy::default());
    }

    #[tokio::test]
    async fn test_update_replaces_section_and_emits() {
        let (gateway, repo) = make_repo();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        gateway
            .events()
            .subscribe(EventKind::SettingsUpdated, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });

        let updated = repo
            .update(SettingsPatch {
                ui: Some(UiSettings {
                    theme: "dark".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(repo.get().await.ui.theme, "dark");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_keeps_created_at() {
        let (_, repo) = make_repo();
        let original = repo.get().await;
        repo.update(SettingsPatch {
            storage: Some(RetentionPolicy {
                retention_days: 7,
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();

        let reset = repo.reset().await.unwrap();
        assert_eq!(reset.version, 3);
        assert_eq!(reset.storage.retention_days, 365);
        assert_eq!(reset.created_at, original.created_at);
    }
}
