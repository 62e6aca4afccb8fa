//! Drive Organizer - crawl, analyze and reorganize media folders on a cloud drive
//!
//! [`App`] wires the services together from a [`Config`]: named caches, the
//! per-endpoint rate limiters, the storage gateway, the crawler, the task
//! queue running folder analysis jobs, the organizer and the maintenance loop.

pub mod config;
pub mod error;
pub mod services;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub use crate::config::Config;
use crate::error::{CrawlError, StorageError, TaskQueueError};
use crate::services::analysis::{Analyzer, FilenameGrouper, GroupingResult};
use crate::services::cache::{CacheRegistry, CacheStats};
use crate::services::crawler::Crawler;
use crate::services::folder_job::FolderAnalysisJob;
use crate::services::maintenance;
use crate::services::organizer::{OrganizePlan, OrganizeReport, Organizer};
use crate::services::path_resolver::PathResolver;
use crate::services::rate_limiter::EndpointLimiters;
use crate::services::request_tracker::FolderRequestTracker;
use crate::services::storage::{CredentialRefresher, StorageGateway, StorageProvider};
use crate::services::task_queue::{QueueHealth, QueueInfo, Task, TaskQueueManager, TaskRunner};

/// Builder for [`App`]
pub struct AppBuilder {
    config: Config,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    analyzer: Arc<dyn Analyzer>,
    runner: Option<Arc<dyn TaskRunner>>,
    maintenance: bool,
}

impl AppBuilder {
    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Replace the folder analysis job run by the task queue
    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Skip the periodic maintenance loop
    pub fn without_maintenance(mut self) -> Self {
        self.maintenance = false;
        self
    }

    /// Build every service and start the queue worker. Must be called inside a Tokio runtime.
    pub fn start(self, provider: Arc<dyn StorageProvider>) -> App {
        let config = self.config;

        let caches = Arc::new(CacheRegistry::new(
            &config.path_cache,
            &config.listing_cache,
            &config.analysis_cache,
        ));

        let mut gateway = StorageGateway::new(
            provider,
            EndpointLimiters::new(&config.quotas),
            config.retry.clone(),
        );
        if let Some(refresher) = self.refresher {
            gateway = gateway.with_refresher(refresher);
        }
        let gateway = Arc::new(gateway);

        let tracker = Arc::new(FolderRequestTracker::new());
        let resolver = Arc::new(PathResolver::new(
            gateway.clone(),
            caches.paths.clone(),
            tracker.clone(),
            &config.root_folder_id,
        ));
        let crawler = Arc::new(Crawler::new(
            gateway.clone(),
            resolver.clone(),
            caches.listings.clone(),
            tracker,
            config.crawler.clone(),
        ));

        let runner = self.runner.unwrap_or_else(|| {
            Arc::new(FolderAnalysisJob::new(
                crawler.clone(),
                self.analyzer,
                caches.analysis.clone(),
            ))
        });
        let queue = TaskQueueManager::start(config.task_queue.clone(), runner);
        let organizer = Arc::new(Organizer::new(gateway.clone(), caches.clone()));

        let shutdown = CancellationToken::new();
        let maintenance = self.maintenance.then(|| {
            maintenance::spawn(
                caches.clone(),
                queue.clone(),
                config.maintenance_interval,
                config.completed_max_age_hours,
                shutdown.clone(),
            )
        });

        info!(root_folder_id = %config.root_folder_id, "Drive organizer started");

        App {
            config: Arc::new(config),
            caches,
            gateway,
            resolver,
            crawler,
            queue,
            organizer,
            shutdown,
            maintenance: Mutex::new(maintenance),
        }
    }
}

/// The running service graph
pub struct App {
    pub config: Arc<Config>,
    pub caches: Arc<CacheRegistry>,
    pub gateway: Arc<StorageGateway>,
    pub resolver: Arc<PathResolver>,
    pub crawler: Arc<Crawler>,
    pub queue: TaskQueueManager,
    pub organizer: Arc<Organizer>,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder {
            config,
            refresher: None,
            analyzer: Arc::new(FilenameGrouper::default()),
            runner: None,
            maintenance: true,
        }
    }

    /// Queue an analysis of a folder
    pub fn submit(&self, folder_id: &str, folder_name: &str) -> Result<Uuid, TaskQueueError> {
        self.queue.submit(folder_id, folder_name)
    }

    pub fn status(&self, task_id: Uuid) -> Option<Task> {
        self.queue.get_status(task_id)
    }

    pub fn cancel(&self, task_id: Uuid) -> bool {
        self.queue.cancel(task_id)
    }

    pub fn queue_info(&self) -> QueueInfo {
        self.queue.queue_info()
    }

    pub fn health(&self) -> QueueHealth {
        self.queue.health()
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.caches.stats()
    }

    /// Clear one cache by name; false if the name is unknown
    pub fn clear_cache(&self, name: &str) -> bool {
        self.caches.clear(name)
    }

    pub fn invalidate_folder(&self, folder_id: &str) {
        self.caches.invalidate_folder(folder_id);
    }

    /// Move the files of each group into a folder named after the group
    pub async fn organize(&self, folder_id: &str, result: &GroupingResult) -> OrganizeReport {
        let plan = OrganizePlan::from_result(folder_id, result);
        self.organizer.apply(&plan).await
    }

    pub async fn delete(&self, ids: &[String], parent_id: &str) -> Result<usize, StorageError> {
        self.organizer.delete(ids, parent_id).await
    }

    /// Delete the subfolders of `folder_id` that hold no media files
    pub async fn delete_empty_folders(
        &self,
        folder_id: &str,
        token: &CancellationToken,
    ) -> Result<usize, CrawlError> {
        self.organizer
            .delete_empty_folders(&self.crawler, folder_id, token)
            .await
    }

    /// Stop maintenance and the task queue; active tasks end up CANCELLED
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.queue.shutdown().await;
        info!("Drive organizer stopped");
    }
}
