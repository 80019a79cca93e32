//! Configuration for the reconciliation core.

use crate::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconCoreConfig {
    pub log_level: String,
    pub database: DatabaseConfig,
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Knobs for the batch driver and candidate index.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Page size used when the caller does not supply one.
    pub default_batch_size: i64,
    /// Upper bound on caller-supplied page sizes.
    pub max_batch_size: i64,
    /// Bounded budget for the candidate index cache, in bucket entries.
    pub index_cache_capacity: usize,
    /// First backoff interval for transient store failures.
    pub retry_initial_backoff: Duration,
    /// Total time budget for retries before a run is marked failed.
    pub retry_max_elapsed: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            max_batch_size: 10_000,
            index_cache_capacity: 256,
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_elapsed: Duration::from_secs(30),
        }
    }
}

impl ReconCoreConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::InvalidInput(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            },
            matching: MatchingConfig {
                default_batch_size: parse_env("RECON_DEFAULT_BATCH_SIZE", 100),
                max_batch_size: parse_env("RECON_MAX_BATCH_SIZE", 10_000),
                index_cache_capacity: parse_env("RECON_INDEX_CACHE_CAPACITY", 256),
                retry_initial_backoff: Duration::from_millis(parse_env(
                    "RECON_RETRY_INITIAL_BACKOFF_MS",
                    100,
                )),
                retry_max_elapsed: Duration::from_secs(parse_env(
                    "RECON_RETRY_MAX_ELAPSED_SECS",
                    30,
                )),
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_defaults() {
        let cfg = MatchingConfig::default();
        assert_eq!(cfg.default_batch_size, 100);
        assert_eq!(cfg.max_batch_size, 10_000);
        assert_eq!(cfg.index_cache_capacity, 256);
        assert_eq!(cfg.retry_initial_backoff, Duration::from_millis(100));
    }
}
