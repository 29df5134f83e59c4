use thiserror::Error;

/// Top-level error type for the Tabsplit store.
///
/// The variants separate "the store is unusable" (`ConnectionFailure`,
/// `VersionError`) from data-level outcomes the caller can recover from
/// (`NotFound`, `QuotaExceeded`, `InvalidData`). The storage crate maps
/// substrate errors into these variants so callers never match on SQLite
/// error codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TabsplitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Schema version {stored} is newer than supported version {supported}")]
    VersionError { stored: u32, supported: u32 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TabsplitError {
    /// Build a `NotFound` error for a record in the named collection.
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        TabsplitError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Whether the store is unusable after this error.
    ///
    /// Fatal errors are never retried internally; callers should surface
    /// them instead of treating them as an empty result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TabsplitError::ConnectionFailure(_) | TabsplitError::VersionError { .. }
        )
    }
}

impl From<toml::de::Error> for TabsplitError {
    fn from(err: toml::de::Error) -> Self {
        TabsplitError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TabsplitError {
    fn from(err: toml::ser::Error) -> Self {
        TabsplitError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TabsplitError {
    fn from(err: serde_json::Error) -> Self {
        TabsplitError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Tabsplit operations.
pub type Result<T> = std::result::Result<T, TabsplitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TabsplitError::not_found("calculations", "abc");
        assert_eq!(err.to_string(), "Record not found: calculations/abc");

        let err = TabsplitError::VersionError {
            stored: 5,
            supported: 2,
        };
        assert_eq!(
            err.to_string(),
            "Schema version 5 is newer than supported version 2"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TabsplitError::ConnectionFailure("gone".into()).is_fatal());
        assert!(TabsplitError::VersionError {
            stored: 3,
            supported: 2
        }
        .is_fatal());
        assert!(!TabsplitError::not_found("images", "x").is_fatal());
        assert!(!TabsplitError::QuotaExceeded("full".into()).is_fatal());
        assert!(!TabsplitError::InvalidData("bad".into()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TabsplitError = io_err.into();
        assert!(matches!(err, TabsplitError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: TabsplitError = json_err.into();
        assert!(matches!(err, TabsplitError::Serialization(_)));
    }
}
