//! Configuration for the bulk store

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BulkError, Result};

/// Store, cache and archiver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sqlx SQLite URL, e.g. `sqlite:/var/lib/bulk/bulk.sqlite3`
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Maximum number of cached requests
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Cached requests expire this long after their last access
    #[serde(default = "default_cache_expiry_secs")]
    pub cache_expiry_secs: u64,

    /// Maximum targets per request info page, and summaries per listing
    #[serde(default = "default_page_size")]
    pub page_size: i64,

    /// Terminal requests older than this are archived
    #[serde(default = "default_archive_window_secs")]
    pub archive_window_secs: u64,

    #[serde(default = "default_archive_period_secs")]
    pub archive_period_secs: u64,
}

fn default_database_url() -> String {
    "sqlite:bulk.sqlite3".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_cache_expiry_secs() -> u64 {
    600
}

fn default_page_size() -> i64 {
    10_000
}

fn default_archive_window_secs() -> u64 {
    14 * 24 * 3600
}

fn default_archive_period_secs() -> u64 {
    6 * 3600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            cache_capacity: default_cache_capacity(),
            cache_expiry_secs: default_cache_expiry_secs(),
            page_size: default_page_size(),
            archive_window_secs: default_archive_window_secs(),
            archive_period_secs: default_archive_period_secs(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(content).map_err(|e| BulkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| BulkError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size <= 0 {
            return Err(BulkError::Config(format!(
                "page_size must be positive, got {}",
                self.page_size
            )));
        }
        if self.archive_period_secs == 0 {
            return Err(BulkError::Config(
                "archive_period_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_secs)
    }

    pub fn archive_window(&self) -> Duration {
        Duration::from_secs(self.archive_window_secs)
    }

    pub fn archive_period(&self) -> Duration {
        Duration::from_secs(self.archive_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.cache_capacity, 10_000);
        assert_eq!(config.page_size, 10_000);
        assert_eq!(config.archive_window(), Duration::from_secs(1_209_600));
        assert_eq!(config.archive_period(), Duration::from_secs(21_600));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StoreConfig::from_toml_str(
            r#"
            database_url = "sqlite::memory:"
            page_size = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.cache_expiry_secs, 600);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            StoreConfig::from_toml_str("page_size = 0"),
            Err(BulkError::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("page_size = \"many\""),
            Err(BulkError::Config(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bulk.toml");
        let config = StoreConfig {
            cache_capacity: 12,
            ..StoreConfig::default()
        };

        config.save(&path).unwrap();
        assert_eq!(StoreConfig::load(&path).unwrap(), config);
    }
}
