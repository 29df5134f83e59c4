use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque primary key of every stored record.
pub type RecordId = String;

/// Fixed primary key of the settings singleton.
pub const SETTINGS_KEY: &str = "app-settings";

/// Generate a fresh record id.
pub fn new_record_id() -> RecordId {
    Uuid::new_v4().to_string()
}

/// Trim, drop empties, deduplicate and sort a tag list.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// =============================================================================
// Enums
// =============================================================================

/// How a bill is divided between participants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SplitMethod {
    /// Everyone pays the same share.
    #[default]
    Equal,
    /// Each participant pays for the items assigned to them.
    ItemBased,
    /// Shares are given as percentages.
    Percentage,
    /// Shares are entered by hand.
    Custom,
}

// =============================================================================
// Calculation
// =============================================================================

/// A saved bill-split session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calculation {
    pub id: RecordId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Bill input as produced by the calculation engine. Stored verbatim.
    #[serde(default)]
    pub bill_data: Value,
    /// Split result as produced by the calculation engine. Stored verbatim.
    #[serde(default)]
    pub split_result: Value,
    /// Attached images in display order.
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_starred: bool,
    /// Starts at 1 and grows by one on every update.
    pub version: u32,
}

impl Calculation {
    /// Merge a partial update into this record. Identity, timestamps and
    /// version are left to the caller.
    pub fn apply(&mut self, patch: CalculationPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(bill_data) = patch.bill_data {
            self.bill_data = bill_data;
        }
        if let Some(split_result) = patch.split_result {
            self.split_result = split_result;
        }
        if let Some(tags) = patch.tags {
            self.tags = normalize_tags(&tags);
        }
        if let Some(is_starred) = patch.is_starred {
            self.is_starred = is_starred;
        }
    }

    /// Total bytes of all referenced images.
    pub fn image_bytes(&self) -> u64 {
        self.images.iter().map(|image| image.size).sum()
    }
}

/// Lightweight reference from a calculation to one of its images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub id: RecordId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Input for creating a calculation.
#[derive(Clone, Debug, Default)]
pub struct NewCalculation {
    pub name: String,
    pub description: Option<String>,
    pub bill_data: Value,
    pub split_result: Value,
    pub images: Vec<NewImage>,
    pub tags: Vec<String>,
    pub is_starred: bool,
}

/// Partial update of a calculation. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default)]
pub struct CalculationPatch {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub bill_data: Option<Value>,
    pub split_result: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub is_starred: Option<bool>,
}

// =============================================================================
// Image
// =============================================================================

/// Pixel size of a stored image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

/// Processing metadata supplied by the image pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Size in bytes before compression.
    pub original_size: u64,
    pub compressed: bool,
    pub enhanced: bool,
}

/// A receipt image owned by exactly one calculation.
///
/// `data` is not part of the serialized document: the store keeps the bytes
/// next to the document, and snapshots carry them explicitly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptImage {
    pub id: RecordId,
    pub calculation_id: RecordId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub dimensions: ImageDimensions,
    #[serde(default)]
    pub metadata: ImageMetadata,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl ReceiptImage {
    /// Materialize a pipeline upload as an image of `calculation_id`.
    pub fn from_upload(
        upload: NewImage,
        calculation_id: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_record_id(),
            calculation_id: calculation_id.to_string(),
            name: upload.name,
            size: upload.data.len() as u64,
            mime_type: upload.mime_type,
            data: upload.data,
            dimensions: upload.dimensions,
            metadata: upload.metadata,
            created_at,
        }
    }

    pub fn to_ref(&self) -> ImageRef {
        ImageRef {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
        }
    }
}

/// An image as handed over by the processing pipeline.
#[derive(Clone, Debug, Default)]
pub struct NewImage {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub dimensions: ImageDimensions,
    pub metadata: ImageMetadata,
}

// =============================================================================
// Template
// =============================================================================

/// A reusable split configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: RecordId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub participants: Value,
    #[serde(default)]
    pub default_split_method: SplitMethod,
    #[serde(default)]
    pub default_settings: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_used: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn apply(&mut self, patch: TemplatePatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(participants) = patch.participants {
            self.participants = participants;
        }
        if let Some(method) = patch.default_split_method {
            self.default_split_method = method;
        }
        if let Some(settings) = patch.default_settings {
            self.default_settings = settings;
        }
        if let Some(tags) = patch.tags {
            self.tags = normalize_tags(&tags);
        }
    }
}

/// Input for creating a template.
#[derive(Clone, Debug, Default)]
pub struct NewTemplate {
    pub name: String,
    pub description: Option<String>,
    pub participants: Value,
    pub default_split_method: SplitMethod,
    pub default_settings: Value,
    pub tags: Vec<String>,
}

/// Partial update of a template. Usage counters are not patchable.
#[derive(Clone, Debug, Default)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub participants: Option<Value>,
    pub default_split_method: Option<SplitMethod>,
    pub default_settings: Option<Value>,
    pub tags: Option<Vec<String>>,
}

// =============================================================================
// Settings
// =============================================================================

/// The process-wide settings singleton.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Always `SETTINGS_KEY`.
    pub id: String,
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub ocr: OcrSettings,
    #[serde(default)]
    pub calculation: CalculationDefaults,
    #[serde(default)]
    pub ui: UiSettings,
    #[serde(default)]
    pub storage: RetentionPolicy,
    pub version: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Settings {
    /// Documented defaults, stamped with `now`.
    pub fn defaults(now: DateTime<Utc>) -> Self {
        Self {
            id: SETTINGS_KEY.to_string(),
            general: GeneralSettings::default(),
            ocr: OcrSettings::default(),
            calculation: CalculationDefaults::default(),
            ui: UiSettings::default(),
            storage: RetentionPolicy::default(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace every section present in the patch.
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(general) = patch.general {
            self.general = general;
        }
        if let Some(ocr) = patch.ocr {
            self.ocr = ocr;
        }
        if let Some(calculation) = patch.calculation {
            self.calculation = calculation;
        }
        if let Some(ui) = patch.ui {
            self.ui = ui;
        }
        if let Some(storage) = patch.storage {
            self.storage = storage;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralSettings {
    pub currency: String,
    pub locale: String,
    pub auto_save: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            locale: "en-US".to_string(),
            auto_save: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OcrSettings {
    pub engine: String,
    pub language: String,
    pub auto_enhance: bool,
    /// Minimum recognition confidence (0.0-1.0) for accepting a line item.
    pub confidence_threshold: f64,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            engine: "tesseract".to_string(),
            language: "eng".to_string(),
            auto_enhance: true,
            confidence_threshold: 0.6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CalculationDefaults {
    pub default_split_method: SplitMethod,
    /// Percent.
    pub tax_rate: f64,
    /// Percent.
    pub tip_percentage: f64,
    pub rounding_precision: f64,
}

impl Default for CalculationDefaults {
    fn default() -> Self {
        Self {
            default_split_method: SplitMethod::Equal,
            tax_rate: 0.0,
            tip_percentage: 15.0,
            rounding_precision: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UiSettings {
    pub theme: String,
    pub compact_mode: bool,
    pub show_tutorial: bool,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            theme: "system".to_string(),
            compact_mode: false,
            show_tutorial: true,
        }
    }
}

/// Retention policy applied by cleanup runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Whether scheduled cleanup runs apply this policy.
    pub auto_cleanup: bool,
    /// Calculations older than this many days are removed.
    pub retention_days: u32,
    /// Upper bound on stored calculations. 0 means unlimited.
    pub max_calculations: u32,
    pub max_storage_mb: u32,
    pub compress_images: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            auto_cleanup: false,
            retention_days: 365,
            max_calculations: 1_000,
            max_storage_mb: 100,
            compress_images: true,
        }
    }
}

/// Section-level replacement of settings.
#[derive(Clone, Debug, Default)]
pub struct SettingsPatch {
    pub general: Option<GeneralSettings>,
    pub ocr: Option<OcrSettings>,
    pub calculation: Option<CalculationDefaults>,
    pub ui: Option<UiSettings>,
    pub storage: Option<RetentionPolicy>,
}

// =============================================================================
// Shared value types
// =============================================================================

/// Inclusive time window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub from: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.from && instant <= self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn make_calculation() -> Calculation {
        Calculation {
            id: "calc-1".to_string(),
            name: "Dinner".to_string(),
            description: None,
            bill_data: json!({"items": [{"name": "pizza", "price": 20.0}]}),
            split_result: json!({"alice": 10.0, "bob": 10.0}),
            images: vec![],
            created_at: ts(1_700_000_000),
            updated_at: ts(1_700_000_000),
            tags: vec!["food".to_string()],
            is_starred: false,
            version: 1,
        }
    }

    #[test]
    fn test_normalize_tags() {
        let tags = vec![
            " food ".to_string(),
            "travel".to_string(),
            "".to_string(),
            "food".to_string(),
            "   ".to_string(),
        ];
        assert_eq!(normalize_tags(&tags), vec!["food", "travel"]);
    }

    #[test]
    fn test_calculation_serializes_camel_case_millis() {
        let calc = make_calculation();
        let value = serde_json::to_value(&calc).unwrap();
        assert_eq!(value["createdAt"], json!(1_700_000_000_000i64));
        assert_eq!(value["isStarred"], json!(false));
        assert!(value.get("description").is_none());
        assert_eq!(value["billData"]["items"][0]["name"], json!("pizza"));

        let back: Calculation = serde_json::from_value(value).unwrap();
        assert_eq!(back, calc);
    }

    #[test]
    fn test_calculation_patch_applies_only_present_fields() {
        let mut calc = make_calculation();
        calc.description = Some("old".to_string());
        calc.apply(CalculationPatch {
            name: Some("Lunch".to_string()),
            description: Some(None),
            tags: Some(vec!["work".to_string(), " work ".to_string()]),
            ..Default::default()
        });
        assert_eq!(calc.name, "Lunch");
        assert_eq!(calc.description, None);
        assert_eq!(calc.tags, vec!["work"]);
        assert_eq!(calc.split_result, json!({"alice": 10.0, "bob": 10.0}));
        assert_eq!(calc.version, 1);
    }

    #[test]
    fn test_receipt_image_payload_not_serialized() {
        let upload = NewImage {
            name: "receipt.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            data: vec![1, 2, 3, 4],
            ..Default::default()
        };
        let image = ReceiptImage::from_upload(upload, "calc-1", ts(1_700_000_000));
        assert_eq!(image.size, 4);
        assert_eq!(image.calculation_id, "calc-1");

        let value = serde_json::to_value(&image).unwrap();
        assert!(value.get("data").is_none());
        assert_eq!(value["calculationId"], json!("calc-1"));
        assert_eq!(value["mimeType"], json!("image/jpeg"));
    }

    #[test]
    fn test_split_method_wire_names() {
        assert_eq!(
            serde_json::to_value(SplitMethod::ItemBased).unwrap(),
            json!("itemBased")
        );
        let method: SplitMethod = serde_json::from_value(json!("percentage")).unwrap();
        assert_eq!(method, SplitMethod::Percentage);
    }

    #[test]
    fn test_settings_defaults_and_patch() {
        let now = ts(1_700_000_000);
        let mut settings = Settings::defaults(now);
        assert_eq!(settings.id, SETTINGS_KEY);
        assert_eq!(settings.version, 1);
        assert_eq!(settings.general.currency, "USD");
        assert_eq!(settings.storage.retention_days, 365);

        settings.apply(SettingsPatch {
            storage: Some(RetentionPolicy {
                retention_days: 0,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(settings.storage.retention_days, 0);
        assert_eq!(settings.general.currency, "USD");
    }

    #[test]
    fn test_settings_tolerates_missing_sections() {
        let value = json!({
            "id": SETTINGS_KEY,
            "version": 3,
            "createdAt": 1_700_000_000_000i64,
            "updatedAt": 1_700_000_000_000i64,
            "ui": {"theme": "dark"}
        });
        let settings: Settings = serde_json::from_value(value).unwrap();
        assert_eq!(settings.ui.theme, "dark");
        assert!(settings.ui.show_tutorial);
        assert_eq!(settings.ocr, OcrSettings::default());
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let range = DateRange::new(ts(100), ts(200));
        assert!(range.contains(ts(100)));
        assert!(range.contains(ts(200)));
        assert!(!range.contains(ts(201)));
    }
}
