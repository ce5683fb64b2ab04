//! Configuration types

use crate::{CatalogError, CatalogResult, ConfigError};
use serde::{Deserialize, Serialize};

/// Tunables for staging, batch operations, imports and the notification bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CatalogConfig {
    /// Page size requested from connectors during pull
    pub pull_page_size: usize,
    /// Approved changes sent per push call
    pub push_batch_size: usize,
    /// Per-topic broadcast buffer
    pub event_channel_capacity: usize,
    /// Events retained per topic for polling
    pub event_log_capacity: usize,
    /// Max failed records listed on an import job
    pub import_failure_cap: usize,
    /// Upload size limit in bytes
    pub import_max_file_bytes: u64,
    /// Granularity of upload progress in bytes
    pub upload_chunk_bytes: usize,
    /// Retries after a lost compare-and-set
    pub cas_retry_limit: u32,
    /// Per-item failures kept on an operation
    pub operation_failure_cap: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            pull_page_size: 500,
            push_batch_size: 100,
            event_channel_capacity: 1024,
            event_log_capacity: 256,
            import_failure_cap: 100,
            import_max_file_bytes: 10 * 1024 * 1024,
            upload_chunk_bytes: 64 * 1024,
            cas_retry_limit: 1,
            operation_failure_cap: 100,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl CatalogConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CATALOG_PULL_PAGE_SIZE` (default: 500)
    /// - `CATALOG_PUSH_BATCH_SIZE` (default: 100)
    /// - `CATALOG_EVENT_CHANNEL_CAPACITY` (default: 1024)
    /// - `CATALOG_EVENT_LOG_CAPACITY` (default: 256)
    /// - `CATALOG_IMPORT_FAILURE_CAP` (default: 100)
    /// - `CATALOG_IMPORT_MAX_FILE_BYTES` (default: 10 MiB)
    /// - `CATALOG_UPLOAD_CHUNK_BYTES` (default: 64 KiB)
    /// - `CATALOG_CAS_RETRY_LIMIT` (default: 1)
    /// - `CATALOG_OPERATION_FAILURE_CAP` (default: 100)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            pull_page_size: env_or("CATALOG_PULL_PAGE_SIZE", defaults.pull_page_size),
            push_batch_size: env_or("CATALOG_PUSH_BATCH_SIZE", defaults.push_batch_size),
            event_channel_capacity: env_or(
                "CATALOG_EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            ),
            event_log_capacity: env_or("CATALOG_EVENT_LOG_CAPACITY", defaults.event_log_capacity),
            import_failure_cap: env_or("CATALOG_IMPORT_FAILURE_CAP", defaults.import_failure_cap),
            import_max_file_bytes: env_or(
                "CATALOG_IMPORT_MAX_FILE_BYTES",
                defaults.import_max_file_bytes,
            ),
            upload_chunk_bytes: env_or("CATALOG_UPLOAD_CHUNK_BYTES", defaults.upload_chunk_bytes),
            cas_retry_limit: env_or("CATALOG_CAS_RETRY_LIMIT", defaults.cas_retry_limit),
            operation_failure_cap: env_or(
                "CATALOG_OPERATION_FAILURE_CAP",
                defaults.operation_failure_cap,
            ),
        }
    }

    /// Validate the configuration.
    ///
    /// Sizes and capacities must be positive. Failure caps and the retry
    /// limit may be zero.
    pub fn validate(&self) -> CatalogResult<()> {
        let positive = [
            ("pull_page_size", self.pull_page_size as u64),
            ("push_batch_size", self.push_batch_size as u64),
            ("event_channel_capacity", self.event_channel_capacity as u64),
            ("event_log_capacity", self.event_log_capacity as u64),
            ("import_max_file_bytes", self.import_max_file_bytes),
            ("upload_chunk_bytes", self.upload_chunk_bytes as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(CatalogError::Config(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: format!("{} must be greater than 0", field),
                }));
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CatalogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pull_page_size, 500);
        assert_eq!(config.import_max_file_bytes, 10_485_760);
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let config = CatalogConfig {
            pull_page_size: 0,
            ..CatalogConfig::default()
        };
        match config.validate() {
            Err(CatalogError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "pull_page_size");
            }
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_caps_allowed() {
        let config = CatalogConfig {
            import_failure_cap: 0,
            cas_retry_limit: 0,
            ..CatalogConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides_defaults() {
        std::env::set_var("CATALOG_PUSH_BATCH_SIZE", "25");
        let config = CatalogConfig::from_env();
        std::env::remove_var("CATALOG_PUSH_BATCH_SIZE");
        assert_eq!(config.push_batch_size, 25);
        assert_eq!(config.pull_page_size, CatalogConfig::default().pull_page_size);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("CATALOG_TEST_ONLY_GARBAGE", "not-a-number");
        assert_eq!(env_or("CATALOG_TEST_ONLY_GARBAGE", 7usize), 7);
        std::env::set_var("CATALOG_TEST_ONLY_GARBAGE", " 12 ");
        assert_eq!(env_or("CATALOG_TEST_ONLY_GARBAGE", 7usize), 12);
        std::env::remove_var("CATALOG_TEST_ONLY_GARBAGE");
    }
}
