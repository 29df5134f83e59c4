//! Schema registry: the declared collections, their keys and indexes.
//!
//! Every collection is one table holding the JSON document, an optional
//! binary payload, and one column per single-field index. Multi-entry
//! indexes (tag lists) get a side table with one row per element.
//! `migrations` turns these declarations into DDL, version by version.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use tabsplit_core::error::{Result, TabsplitError};
use tabsplit_core::types::{Calculation, ReceiptImage, Settings, Template};

/// Latest schema version known by this binary.
pub const SCHEMA_VERSION: u32 = 2;

pub const CALCULATIONS: &str = "calculations";
pub const IMAGES: &str = "images";
pub const TEMPLATES: &str = "templates";
pub const SETTINGS: &str = "settings";

/// Index names. Each index is named after the key path it covers.
pub mod index {
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const NAME: &str = "name";
    pub const IS_STARRED: &str = "isStarred";
    pub const TAGS: &str = "tags";
    pub const CALCULATION_ID: &str = "calculationId";
    pub const USAGE_COUNT: &str = "usageCount";
    pub const LAST_USED: &str = "lastUsed";
}

/// A secondary index over one document field.
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    /// Dotted path into the document.
    pub key_path: &'static str,
    /// Index every element of an array field instead of the field itself.
    pub multi_entry: bool,
    /// Compare text case-insensitively.
    pub nocase: bool,
    /// Schema version that introduced the index.
    pub since: u32,
}

/// A named record collection.
#[derive(Debug)]
pub struct CollectionDef {
    pub name: &'static str,
    /// Dotted path of the primary key inside the document.
    pub key_path: &'static str,
    /// Whether records carry a binary payload next to the document.
    pub has_payload: bool,
    /// Schema version that introduced the collection.
    pub since: u32,
    pub indexes: &'static [IndexDef],
}

impl CollectionDef {
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|ix| ix.name == name)
    }

    /// Indexes stored as columns of the main table.
    pub fn column_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(|ix| !ix.multi_entry)
    }

    /// Indexes stored in side tables.
    pub fn multi_entry_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(|ix| ix.multi_entry)
    }

    pub(crate) fn column(&self, index: &IndexDef) -> String {
        format!("ix_{}", index.name)
    }

    pub(crate) fn side_table(&self, index: &IndexDef) -> String {
        format!("{}__{}", self.name, index.name)
    }

    pub(crate) fn sql_index(&self, index: &IndexDef) -> String {
        format!("idx_{}_{}", self.name, index.name)
    }
}

const fn single(name: &'static str, since: u32) -> IndexDef {
    IndexDef {
        name,
        key_path: name,
        multi_entry: false,
        nocase: false,
        since,
    }
}

const fn text(name: &'static str, since: u32) -> IndexDef {
    IndexDef {
        name,
        key_path: name,
        multi_entry: false,
        nocase: true,
        since,
    }
}

const fn multi(name: &'static str, since: u32) -> IndexDef {
    IndexDef {
        name,
        key_path: name,
        multi_entry: true,
        nocase: false,
        since,
    }
}

/// Every collection of the store, in creation order.
pub static COLLECTIONS: &[CollectionDef] = &[
    CollectionDef {
        name: CALCULATIONS,
        key_path: "id",
        has_payload: false,
        since: 1,
        indexes: &[
            single(index::CREATED_AT, 1),
            single(index::UPDATED_AT, 1),
            text(index::NAME, 1),
            single(index::IS_STARRED, 1),
            multi(index::TAGS, 1),
        ],
    },
    CollectionDef {
        name: IMAGES,
        key_path: "id",
        has_payload: true,
        since: 1,
        indexes: &[
            single(index::CALCULATION_ID, 1),
            single(index::CREATED_AT, 1),
        ],
    },
    CollectionDef {
        name: TEMPLATES,
        key_path: "id",
        has_payload: false,
        since: 1,
        indexes: &[
            text(index::NAME, 1),
            single(index::CREATED_AT, 1),
            multi(index::TAGS, 1),
            single(index::USAGE_COUNT, 2),
            single(index::LAST_USED, 2),
        ],
    },
    CollectionDef {
        name: SETTINGS,
        key_path: "id",
        has_payload: false,
        since: 1,
        indexes: &[],
    },
];

/// Look up a declared collection.
pub fn collection(name: &str) -> Result<&'static CollectionDef> {
    COLLECTIONS
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| TabsplitError::Storage(format!("Unknown collection `{}`", name)))
}

/// Resolve a dotted key path inside a document.
pub fn extract_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// A record type stored in one of the declared collections.
///
/// The JSON document carries every field except the binary payload, which
/// the store keeps in its own column.
pub trait Document: Serialize + DeserializeOwned + Send + 'static {
    const COLLECTION: &'static str;

    fn key(&self) -> &str;

    fn payload(&self) -> Option<&[u8]> {
        None
    }

    fn attach_payload(&mut self, _payload: Vec<u8>) {}
}

impl Document for Calculation {
    const COLLECTION: &'static str = CALCULATIONS;

    fn key(&self) -> &str {
        &self.id
    }
}

impl Document for ReceiptImage {
    const COLLECTION: &'static str = IMAGES;

    fn key(&self) -> &str {
        &self.id
    }

    fn payload(&self) -> Option<&[u8]> {
        Some(&self.data)
    }

    fn attach_payload(&mut self, payload: Vec<u8>) {
        self.data = payload;
    }
}

impl Document for Template {
    const COLLECTION: &'static str = TEMPLATES;

    fn key(&self) -> &str {
        &self.id
    }
}

impl Document for Settings {
    const COLLECTION: &'static str = SETTINGS;

    fn key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_document_has_a_collection() {
        for name in [
            Calculation::COLLECTION,
            ReceiptImage::COLLECTION,
            Template::COLLECTION,
            Settings::COLLECTION,
        ] {
            assert!(collection(name).is_ok(), "missing collection {}", name);
        }
    }

    #[test]
    fn test_unknown_collection_is_an_error() {
        assert!(matches!(
            collection("receipts"),
            Err(TabsplitError::Storage(_))
        ));
    }

    #[test]
    fn test_index_versions_never_precede_collection() {
        for def in COLLECTIONS {
            assert!(def.since >= 1 && def.since <= SCHEMA_VERSION);
            for ix in def.indexes {
                assert!(ix.since >= def.since, "{}.{}", def.name, ix.name);
                assert!(ix.since <= SCHEMA_VERSION, "{}.{}", def.name, ix.name);
            }
        }
    }

    #[test]
    fn test_index_names_are_sql_identifiers() {
        for def in COLLECTIONS {
            assert!(def.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
            for ix in def.indexes {
                assert!(ix.name.chars().all(|c| c.is_ascii_alphanumeric()));
            }
        }
    }

    #[test]
    fn test_extract_path_nested() {
        let doc = json!({"id": "a", "metadata": {"compressed": true}});
        assert_eq!(extract_path(&doc, "id"), Some(&json!("a")));
        assert_eq!(
            extract_path(&doc, "metadata.compressed"),
            Some(&json!(true))
        );
        assert_eq!(extract_path(&doc, "metadata.missing"), None);
    }

    #[test]
    fn test_column_and_side_table_names() {
        let calcs = collection(CALCULATIONS).unwrap();
        let created = calcs.index(index::CREATED_AT).unwrap();
        let tags = calcs.index(index::TAGS).unwrap();
        assert_eq!(calcs.column(created), "ix_createdAt");
        assert_eq!(calcs.side_table(tags), "calculations__tags");
        assert_eq!(calcs.multi_entry_indexes().count(), 1);
        assert_eq!(calcs.column_indexes().count(), 4);
    }
}
