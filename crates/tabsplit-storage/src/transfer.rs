//! Snapshot export and import.
//!
//! A snapshot is a self-describing JSON document holding calculations,
//! optionally their images with payload bytes, templates and the settings
//! record. Imports are validated in full before anything is written, then
//! applied in a single transaction.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use tabsplit_core::error::{Result, TabsplitError};
use tabsplit_core::events::StorageEvent;
use tabsplit_core::types::{
    Calculation, DateRange, ReceiptImage, Settings, Template, SETTINGS_KEY,
};

use crate::gateway::Gateway;
use crate::schema::{index, Document, CALCULATIONS, IMAGES, SCHEMA_VERSION, SETTINGS, TEMPLATES};
use crate::tx::{CursorSpec, KeyRange, Tx};

const ALL_COLLECTIONS: &[&str] = &[CALCULATIONS, IMAGES, TEMPLATES, SETTINGS];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Include image records and their bytes.
    pub include_images: bool,
    /// Only export calculations created inside this range.
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub schema_version: u32,
    pub app_version: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub exported_at: DateTime<Utc>,
    pub calculation_count: usize,
    pub image_count: usize,
    pub template_count: usize,
    /// Sum of the image sizes referenced by the exported calculations.
    pub total_size: u64,
    /// The requested range, or the span of the exported calculations.
    /// `None` only when nothing was exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

/// An image record together with its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotImage {
    #[serde(flatten)]
    pub image: ReceiptImage,
    pub data: Vec<u8>,
}

impl SnapshotImage {
    fn from_stored(mut image: ReceiptImage) -> Self {
        let data = std::mem::take(&mut image.data);
        Self { image, data }
    }

    fn into_stored(self) -> ReceiptImage {
        ReceiptImage {
            data: self.data,
            ..self.image
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    #[serde(default)]
    pub calculations: Vec<Calculation>,
    #[serde(default)]
    pub images: Vec<SnapshotImage>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a snapshot.
    pub fn from_json(text: &str) -> Result<Snapshot> {
        let value: Value = serde_json::from_str(text)?;
        match validate_snapshot(&value) {
            SnapshotValidation::Valid(snapshot) => Ok(snapshot),
            SnapshotValidation::Invalid(reasons) => Err(invalid(&reasons)),
        }
    }
}

/// Outcome of checking a snapshot before import.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotValidation {
    Valid(Snapshot),
    Invalid(Vec<String>),
}

impl SnapshotValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, SnapshotValidation::Valid(_))
    }
}

/// Check the shape and consistency of an untrusted snapshot document.
pub fn validate_snapshot(value: &Value) -> SnapshotValidation {
    if !value.is_object() {
        return SnapshotValidation::Invalid(vec!["snapshot must be a JSON object".to_string()]);
    }
    let snapshot: Snapshot = match serde_json::from_value(value.clone()) {
        Ok(snapshot) => snapshot,
        Err(e) => return SnapshotValidation::Invalid(vec![format!("malformed snapshot: {}", e)]),
    };
    let reasons = snapshot_problems(&snapshot);
    if reasons.is_empty() {
        SnapshotValidation::Valid(snapshot)
    } else {
        SnapshotValidation::Invalid(reasons)
    }
}

fn snapshot_problems(snapshot: &Snapshot) -> Vec<String> {
    let mut reasons = Vec::new();
    let meta = &snapshot.metadata;

    if meta.schema_version == 0 || meta.schema_version > SCHEMA_VERSION {
        reasons.push(format!(
            "unsupported schema version {} (supported: 1..={})",
            meta.schema_version, SCHEMA_VERSION
        ));
    }

    let mut seen = HashSet::new();
    for calc in &snapshot.calculations {
        check_id(&mut reasons, &mut seen, "calculation", &calc.id);
        if calc.name.trim().is_empty() {
            reasons.push(format!("calculation {} has an empty name", calc.id));
        }
        if calc.version < 1 {
            reasons.push(format!("calculation {} has version 0", calc.id));
        }
        if calc.updated_at < calc.created_at {
            reasons.push(format!("calculation {} was updated before it was created", calc.id));
        }
    }

    let mut seen = HashSet::new();
    for entry in &snapshot.images {
        let image = &entry.image;
        check_id(&mut reasons, &mut seen, "image", &image.id);
        if image.calculation_id.is_empty() {
            reasons.push(format!("image {} has no calculation", image.id));
        }
        if image.size != entry.data.len() as u64 {
            reasons.push(format!(
                "image {} declares {} bytes but carries {}",
                image.id,
                image.size,
                entry.data.len()
            ));
        }
    }

    let mut seen = HashSet::new();
    for template in &snapshot.templates {
        check_id(&mut reasons, &mut seen, "template", &template.id);
    }

    if let Some(settings) = &snapshot.settings {
        if settings.id != SETTINGS_KEY {
            reasons.push(format!("settings record has unexpected id {}", settings.id));
        }
    }
    reasons
}

fn check_id<'a>(
    reasons: &mut Vec<String>,
    seen: &mut HashSet<&'a str>,
    kind: &str,
    id: &'a str,
) {
    if id.is_empty() {
        reasons.push(format!("{} with an empty id", kind));
    } else if !seen.insert(id) {
        reasons.push(format!("duplicate {} id {}", kind, id));
    }
}

fn invalid(reasons: &[String]) -> TabsplitError {
    TabsplitError::InvalidData(format!("invalid snapshot: {}", reasons.join("; ")))
}

/// Which parts of a snapshot to import and how to treat existing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    pub calculations: bool,
    pub images: bool,
    pub templates: bool,
    pub settings: bool,
    /// Replace records whose key already exists instead of skipping them.
    pub overwrite_existing: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            calculations: true,
            images: true,
            templates: true,
            settings: true,
            overwrite_existing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub calculations: ImportCounts,
    pub images: ImportCounts,
    pub templates: ImportCounts,
    pub settings_imported: bool,
}

pub struct TransferService {
    gateway: Arc<Gateway>,
}

impl TransferService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub async fn export(&self, options: ExportOptions) -> Result<Snapshot> {
        let exported_at = self.gateway.now();
        let snapshot = self
            .gateway
            .read(ALL_COLLECTIONS, move |tx| build_snapshot(tx, options, exported_at))
            .await?;

        info!(
            calculations = snapshot.metadata.calculation_count,
            images = snapshot.metadata.image_count,
            templates = snapshot.metadata.template_count,
            "Snapshot exported"
        );
        Ok(snapshot)
    }

    pub async fn export_json(&self, options: ExportOptions) -> Result<String> {
        self.export(options).await?.to_json()
    }

    /// Validate then apply a snapshot in one transaction.
    pub async fn import(&self, snapshot: Snapshot, options: ImportOptions) -> Result<ImportReport> {
        let reasons = snapshot_problems(&snapshot);
        if !reasons.is_empty() {
            return Err(invalid(&reasons));
        }

        let timestamp = self.gateway.now();
        let (report, events) = self
            .gateway
            .write(ALL_COLLECTIONS, move |tx| {
                apply_snapshot(tx, snapshot, options, timestamp)
            })
            .await?;

        info!(
            calculations = report.calculations.imported,
            images = report.images.imported,
            templates = report.templates.imported,
            skipped = report.calculations.skipped + report.images.skipped + report.templates.skipped,
            "Snapshot imported"
        );
        for event in events {
            self.gateway.emit(event);
        }
        Ok(report)
    }

    pub async fn import_json(&self, text: &str, options: ImportOptions) -> Result<ImportReport> {
        let snapshot = Snapshot::from_json(text)?;
        self.import(snapshot, options).await
    }
}

fn build_snapshot(
    tx: &Tx<'_>,
    options: ExportOptions,
    exported_at: DateTime<Utc>,
) -> Result<Snapshot> {
    let mut spec = CursorSpec::on(index::CREATED_AT);
    if let Some(range) = options.date_range {
        spec = spec.range(KeyRange::between(range.from, range.to));
    }
    let calculations = tx.collect::<Calculation>(&spec)?;

    let mut images = Vec::new();
    if options.include_images {
        for calc in &calculations {
            let stored = tx.collect::<ReceiptImage>(
                &CursorSpec::on(index::CALCULATION_ID).range(KeyRange::only(calc.id.as_str())),
            )?;
            images.extend(stored.into_iter().map(SnapshotImage::from_stored));
        }
    }

    let templates = tx.collect::<Template>(&CursorSpec::primary())?;
    let settings = tx.get::<Settings>(SETTINGS_KEY)?;

    // Without a filter the snapshot covers its oldest to newest calculation.
    let date_range = options.date_range.or_else(|| {
        let first = calculations.first()?;
        let last = calculations.last()?;
        Some(DateRange::new(first.created_at, last.created_at))
    });

    Ok(Snapshot {
        metadata: SnapshotMetadata {
            schema_version: SCHEMA_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at,
            calculation_count: calculations.len(),
            image_count: images.len(),
            template_count: templates.len(),
            total_size: calculations.iter().map(Calculation::image_bytes).sum(),
            date_range,
        },
        calculations,
        images,
        templates,
        settings,
    })
}

fn apply_snapshot(
    tx: &Tx<'_>,
    snapshot: Snapshot,
    options: ImportOptions,
    timestamp: DateTime<Utc>,
) -> Result<(ImportReport, Vec<StorageEvent>)> {
    let mut report = ImportReport::default();
    // Emitted by the caller once the transaction commits.
    let mut events = Vec::new();
    let overwrite = options.overwrite_existing;

    if options.calculations {
        for calc in snapshot.calculations {
            match store(tx, &calc, overwrite)? {
                Stored::Created => {
                    report.calculations.imported += 1;
                    events.push(StorageEvent::CalculationCreated {
                        id: calc.id.clone(),
                        name: calc.name.clone(),
                        image_count: calc.images.len(),
                        timestamp,
                    });
                }
                Stored::Replaced => {
                    report.calculations.imported += 1;
                    events.push(StorageEvent::CalculationUpdated {
                        id: calc.id.clone(),
                        version: calc.version,
                        timestamp,
                    });
                }
                Stored::Skipped => report.calculations.skipped += 1,
            }
        }
    }

    if options.images {
        for entry in snapshot.images {
            let image = entry.into_stored();
            if !tx.contains::<Calculation>(&image.calculation_id)? {
                report.images.skipped += 1;
                continue;
            }
            match store(tx, &image, overwrite)? {
                Stored::Created | Stored::Replaced => report.images.imported += 1,
                Stored::Skipped => report.images.skipped += 1,
            }
        }
    }

    if options.templates {
        for template in snapshot.templates {
            match store(tx, &template, overwrite)? {
                Stored::Created => {
                    report.templates.imported += 1;
                    events.push(StorageEvent::TemplateCreated {
                        id: template.id.clone(),
                        name: template.name.clone(),
                        timestamp,
                    });
                }
                Stored::Replaced => {
                    report.templates.imported += 1;
                    events.push(StorageEvent::TemplateUpdated {
                        id: template.id.clone(),
                        usage_count: template.usage_count,
                        timestamp,
                    });
                }
                Stored::Skipped => report.templates.skipped += 1,
            }
        }
    }

    if options.settings {
        if let Some(settings) = snapshot.settings {
            tx.put(&settings)?;
            report.settings_imported = true;
            events.push(StorageEvent::SettingsUpdated {
                version: settings.version,
                timestamp,
            });
        }
    }

    Ok((report, events))
}

enum Stored {
    Created,
    Replaced,
    Skipped,
}

fn store<D: Document>(tx: &Tx<'_>, record: &D, overwrite: bool) -> Result<Stored> {
    if tx.add(record)? {
        return Ok(Stored::Created);
    }
    if overwrite {
        tx.put(record)?;
        Ok(Stored::Replaced)
    } else {
        Ok(Stored::Skipped)
    }
}
