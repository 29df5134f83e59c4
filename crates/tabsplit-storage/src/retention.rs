//! Retention policy enforcement and store maintenance.
//!
//! Removes calculations past their retention age or beyond the configured
//! maximum count (always with their images), reclaims orphaned images, and
//! reports on referential integrity and quota usage. Nothing here runs on a
//! timer; callers trigger each operation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use tabsplit_core::error::Result;
use tabsplit_core::events::StorageEvent;
use tabsplit_core::types::{Calculation, ReceiptImage, RecordId, RetentionPolicy};

use crate::gateway::Gateway;
use crate::repository::delete_cascade;
use crate::schema::{index, CALCULATIONS, IMAGES};
use crate::settings::SettingsRepository;
use crate::tx::{CursorSpec, CursorStep, KeyRange, Tx};

/// Which cleanup steps a run performs. Steps left as `None`/`false` are
/// skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Remove calculations created this many days ago or earlier.
    pub older_than_days: Option<u32>,
    /// Keep at most this many calculations, removing the oldest. 0 keeps all.
    pub max_calculations: Option<u32>,
    /// Remove images whose calculation no longer exists.
    pub reclaim_orphans: bool,
}

/// Outcome of a cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub calculations_removed: usize,
    /// Images removed with their calculations plus reclaimed orphans.
    pub images_removed: usize,
    pub orphans_removed: usize,
}

impl CleanupReport {
    fn absorb(&mut self, other: CleanupReport) {
        self.calculations_removed += other.calculations_removed;
        self.images_removed += other.images_removed;
        self.orphans_removed += other.orphans_removed;
    }
}

/// An image reference that does not resolve to an image of that calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingReference {
    pub calculation_id: RecordId,
    pub image_id: RecordId,
}

/// Result of `RetentionManager::integrity_check`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub calculations_checked: u64,
    pub images_checked: u64,
    /// Images whose calculation does not exist.
    pub orphan_images: Vec<RecordId>,
    pub dangling_references: Vec<DanglingReference>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_images.is_empty() && self.dangling_references.is_empty()
    }
}

/// Database size against the effective quota.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
    /// `used_bytes / quota_bytes`, when a quota applies.
    pub usage_ratio: Option<f64>,
    pub warning: bool,
}

pub struct RetentionManager {
    gateway: Arc<Gateway>,
}

impl RetentionManager {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Remove calculations created `days` or more days ago. Without an
    /// argument the `retentionDays` setting applies.
    pub async fn cleanup_older_than(&self, days: Option<u32>) -> Result<CleanupReport> {
        let days = match days {
            Some(days) => days,
            None => self.policy().await.retention_days,
        };
        self.run(CleanupOptions {
            older_than_days: Some(days),
            ..Default::default()
        })
        .await
    }

    /// Remove the oldest calculations beyond `max`. Without an argument the
    /// `maxCalculations` setting applies; 0 means unlimited.
    pub async fn enforce_max_count(&self, max: Option<u32>) -> Result<CleanupReport> {
        let max = match max {
            Some(max) => max,
            None => self.policy().await.max_calculations,
        };
        self.run(CleanupOptions {
            max_calculations: Some(max),
            ..Default::default()
        })
        .await
    }

    pub async fn reclaim_orphan_images(&self) -> Result<CleanupReport> {
        self.run(CleanupOptions {
            reclaim_orphans: true,
            ..Default::default()
        })
        .await
    }

    /// Perform the selected steps in one transaction and emit one
    /// `storage_cleanup` event.
    pub async fn run(&self, options: CleanupOptions) -> Result<CleanupReport> {
        let now = self.gateway.now();
        let report = self
            .gateway
            .write(&[CALCULATIONS, IMAGES], move |tx| {
                let mut report = CleanupReport::default();
                if let Some(days) = options.older_than_days {
                    // A span reaching past the earliest representable instant removes nothing.
                    let cutoff = now
                        .checked_sub_signed(Duration::days(i64::from(days)))
                        .unwrap_or(DateTime::<Utc>::MIN_UTC);
                    report.absorb(remove_created_before(tx, cutoff)?);
                }
                if let Some(max) = options.max_calculations {
                    report.absorb(remove_excess(tx, max)?);
                }
                if options.reclaim_orphans {
                    report.absorb(remove_orphans(tx)?);
                }
                Ok(report)
            })
            .await?;

        info!(
            calculations = report.calculations_removed,
            images = report.images_removed,
            orphans = report.orphans_removed,
            "Cleanup complete"
        );
        self.gateway.emit(StorageEvent::StorageCleanup {
            calculations_removed: report.calculations_removed,
            images_removed: report.images_removed,
            timestamp: self.gateway.now(),
        });
        Ok(report)
    }

    /// Apply the stored retention policy if `autoCleanup` is enabled.
    /// Returns `None` when it is disabled.
    pub async fn run_scheduled(&self) -> Result<Option<CleanupReport>> {
        let policy = self.policy().await;
        if !policy.auto_cleanup {
            debug!("Automatic cleanup disabled, skipping");
            return Ok(None);
        }
        self.run(CleanupOptions {
            older_than_days: Some(policy.retention_days),
            max_calculations: Some(policy.max_calculations),
            reclaim_orphans: false,
        })
        .await
        .map(Some)
    }

    /// Look for orphan images and dangling references without changing
    /// anything.
    pub async fn integrity_check(&self) -> Result<IntegrityReport> {
        self.gateway
            .read(&[CALCULATIONS, IMAGES], |tx| {
                let mut report = IntegrityReport::default();
                let live: HashSet<RecordId> =
                    tx.keys::<Calculation>(&CursorSpec::primary())?.into_iter().collect();
                report.calculations_checked = live.len() as u64;

                let mut owners: HashSet<(RecordId, RecordId)> = HashSet::new();
                tx.cursor(&CursorSpec::primary().without_payload(), |image: ReceiptImage| {
                    report.images_checked += 1;
                    if !live.contains(&image.calculation_id) {
                        report.orphan_images.push(image.id.clone());
                    }
                    owners.insert((image.calculation_id, image.id));
                    Ok(CursorStep::Continue)
                })?;

                tx.cursor(&CursorSpec::primary(), |calc: Calculation| {
                    for image_ref in calc.images {
                        if !owners.contains(&(calc.id.clone(), image_ref.id.clone())) {
                            report.dangling_references.push(DanglingReference {
                                calculation_id: calc.id.clone(),
                                image_id: image_ref.id,
                            });
                        }
                    }
                    Ok(CursorStep::Continue)
                })?;
                Ok(report)
            })
            .await
    }

    /// Compare the database size to the quota and warn when usage reaches
    /// the configured warning ratio.
    ///
    /// The quota is `storage.quota_kb` from the configuration, falling back
    /// to the `maxStorageMb` setting.
    pub async fn check_quota(&self) -> Result<QuotaStatus> {
        let used_bytes = self.gateway.database_size().await?;
        let config = self.gateway.config();
        let quota_bytes = match config.quota_bytes() {
            Some(quota) => Some(quota),
            None => {
                let mb = u64::from(self.policy().await.max_storage_mb);
                (mb > 0).then(|| mb * 1024 * 1024)
            }
        };

        let usage_ratio = quota_bytes.map(|quota| used_bytes as f64 / quota as f64);
        let warning = usage_ratio.is_some_and(|ratio| ratio >= config.quota_warning_ratio);

        if let (true, Some(ratio)) = (warning, usage_ratio) {
            let message = format!("Storage is {:.0}% full", ratio * 100.0);
            warn!(used_bytes, ?quota_bytes, "{}", message);
            self.gateway.emit(StorageEvent::StorageQuotaWarning {
                used_bytes,
                quota_bytes,
                message,
                timestamp: self.gateway.now(),
            });
        }

        Ok(QuotaStatus {
            used_bytes,
            quota_bytes,
            usage_ratio,
            warning,
        })
    }

    async fn policy(&self) -> RetentionPolicy {
        SettingsRepository::new(Arc::clone(&self.gateway))
            .get()
            .await
            .storage
    }
}

fn remove_all(tx: &Tx<'_>, ids: &[RecordId]) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    for id in ids {
        if let Some(images) = delete_cascade(tx, id)? {
            report.calculations_removed += 1;
            report.images_removed += images;
        }
    }
    Ok(report)
}

/// Remove calculations with `createdAt <= cutoff`.
fn remove_created_before(tx: &Tx<'_>, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
    let expired = tx.keys::<Calculation>(
        &CursorSpec::on(index::CREATED_AT).range(KeyRange::at_most(cutoff)),
    )?;
    remove_all(tx, &expired)
}

/// Remove the oldest calculations until at most `max` remain.
fn remove_excess(tx: &Tx<'_>, max: u32) -> Result<CleanupReport> {
    if max == 0 {
        return Ok(CleanupReport::default());
    }
    let count = tx.count::<Calculation>()?;
    let excess = count.saturating_sub(u64::from(max)) as usize;
    if excess == 0 {
        return Ok(CleanupReport::default());
    }
    let oldest: Vec<RecordId> = tx
        .keys::<Calculation>(&CursorSpec::on(index::CREATED_AT))?
        .into_iter()
        .take(excess)
        .collect();
    remove_all(tx, &oldest)
}

fn remove_orphans(tx: &Tx<'_>) -> Result<CleanupReport> {
    let live: HashSet<RecordId> = tx
        .keys::<Calculation>(&CursorSpec::primary())?
        .into_iter()
        .collect();
    let mut orphans = Vec::new();
    tx.cursor(&CursorSpec::primary().without_payload(), |image: ReceiptImage| {
        if !live.contains(&image.calculation_id) {
            orphans.push(image.id);
        }
        Ok(CursorStep::Continue)
    })?;
    for id in &orphans {
        tx.delete::<ReceiptImage>(id)?;
    }
    Ok(CleanupReport {
        calculations_removed: 0,
        images_removed: orphans.len(),
        orphans_removed: orphans.len(),
    })
}
