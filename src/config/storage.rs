//! Storage configuration types.

use serde::Deserialize;

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: `sqlite` or `memory`.
    #[serde(rename = "type")]
    pub storage_type: String,
    /// SQLite database file path.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            path: "gophermart.db".to_string(),
        }
    }
}

impl StorageConfig {
    /// In-memory storage, for tests and dry runs.
    pub fn memory() -> Self {
        Self {
            storage_type: "memory".to_string(),
            path: String::new(),
        }
    }
}
