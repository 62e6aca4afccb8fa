//! Application configuration management

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::services::cache::CacheConfig;
use crate::services::crawler::CrawlerConfig;
use crate::services::rate_limiter::EndpointQuotas;
use crate::services::retry::RetryPolicy;
use crate::services::task_queue::TaskQueueConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory served by the local storage backend
    pub storage_root: String,

    /// Id of the storage root folder
    pub root_folder_id: String,

    /// Per-endpoint request rates
    pub quotas: EndpointQuotas,

    /// Folder id -> full path cache
    pub path_cache: CacheConfig,

    /// Folder id -> listing cache
    pub listing_cache: CacheConfig,

    /// Folder id -> grouping result cache
    pub analysis_cache: CacheConfig,

    pub task_queue: TaskQueueConfig,

    pub crawler: CrawlerConfig,

    pub retry: RetryPolicy,

    /// How often the maintenance loop runs
    pub maintenance_interval: Duration,

    /// Completed tasks older than this are dropped by the maintenance loop
    pub completed_max_age_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        let cache = |name: &str, capacity: usize, ttl_secs: u64| CacheConfig {
            name: name.to_string(),
            capacity,
            ttl: Duration::from_secs(ttl_secs),
        };
        Self {
            storage_root: "./data/drive".to_string(),
            root_folder_id: "0".to_string(),
            quotas: EndpointQuotas::default(),
            path_cache: cache("path", 1000, 3600),
            listing_cache: cache("listing", 500, 300),
            analysis_cache: cache("analysis", 100, 1800),
            task_queue: TaskQueueConfig::default(),
            crawler: CrawlerConfig::default(),
            retry: RetryPolicy::default(),
            maintenance_interval: Duration::from_secs(60),
            completed_max_age_hours: 24,
        }
    }
}

impl Config {
    /// Load configuration from environment variables; unset variables keep their defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let quotas = EndpointQuotas {
            listing: env_or("LISTING_QPS", defaults.quotas.listing)?,
            rename: env_or("RENAME_QPS", defaults.quotas.rename)?,
            move_files: env_or("MOVE_QPS", defaults.quotas.move_files)?,
            delete: env_or("DELETE_QPS", defaults.quotas.delete)?,
            general: env_or("GENERAL_QPS", defaults.quotas.general)?,
        };

        let path_cache = cache_from_env("PATH", &defaults.path_cache)?;
        let listing_cache = cache_from_env("LISTING", &defaults.listing_cache)?;
        let analysis_cache = cache_from_env("ANALYSIS", &defaults.analysis_cache)?;

        let task_queue = TaskQueueConfig {
            queue_capacity: env_or("TASK_QUEUE_CAPACITY", defaults.task_queue.queue_capacity)?,
            task_timeout: Duration::from_secs(env_or(
                "TASK_TIMEOUT_SECS",
                defaults.task_queue.task_timeout.as_secs(),
            )?),
            completed_retention: env_or("TASK_RETENTION", defaults.task_queue.completed_retention)?,
            ..defaults.task_queue.clone()
        };

        let crawler = CrawlerConfig {
            max_files: env_or("CRAWL_MAX_FILES", defaults.crawler.max_files)?,
            max_depth: env_or("CRAWL_MAX_DEPTH", defaults.crawler.max_depth)?,
            page_size: env_or("CRAWL_PAGE_SIZE", defaults.crawler.page_size)?,
            workers: env_or("CRAWL_WORKERS", defaults.crawler.workers)?,
            parallel_min: env_or("CRAWL_PARALLEL_MIN", defaults.crawler.parallel_min)?,
            parallel_max: env_or("CRAWL_PARALLEL_MAX", defaults.crawler.parallel_max)?,
        };

        let retry = RetryPolicy {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            delay: Duration::from_millis(env_or(
                "RETRY_DELAY_MS",
                defaults.retry.delay.as_millis() as u64,
            )?),
            ..defaults.retry.clone()
        };

        Ok(Self {
            storage_root: env::var("STORAGE_ROOT").unwrap_or(defaults.storage_root),

            root_folder_id: env::var("ROOT_FOLDER_ID").unwrap_or(defaults.root_folder_id),

            quotas,
            path_cache,
            listing_cache,
            analysis_cache,
            task_queue,
            crawler,
            retry,

            maintenance_interval: Duration::from_secs(env_or(
                "MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval.as_secs(),
            )?),

            completed_max_age_hours: env_or(
                "COMPLETED_MAX_AGE_HOURS",
                defaults.completed_max_age_hours,
            )?,
        })
    }
}

/// `<PREFIX>_CACHE_CAPACITY` and `<PREFIX>_CACHE_TTL_SECS`
fn cache_from_env(prefix: &str, defaults: &CacheConfig) -> Result<CacheConfig> {
    Ok(CacheConfig {
        name: defaults.name.clone(),
        capacity: env_or(&format!("{prefix}_CACHE_CAPACITY"), defaults.capacity)?,
        ttl: Duration::from_secs(env_or(
            &format!("{prefix}_CACHE_TTL_SECS"),
            defaults.ttl.as_secs(),
        )?),
    })
}

/// Read and parse an environment variable, falling back to `default` when unset
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
