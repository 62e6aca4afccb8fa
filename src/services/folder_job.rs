//! Folder analysis job run by the task queue worker
//!
//! Looks up the analysis cache, crawls the folder, runs the analyzer over
//! the collected media files and memoizes the result per folder id. Results
//! of crawls that skipped folders are returned but not memoized.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::AnalysisError;
use crate::services::analysis::{Analyzer, GroupingResult};
use crate::services::cache::AnalysisCache;
use crate::services::crawler::{CrawlLimits, Crawler};
use crate::services::task_queue::{TaskContext, TaskRunner};

/// Progress reached once the crawl has started
const CRAWL_START: f32 = 5.0;
/// Progress reached once the crawl has finished
const CRAWL_DONE: f32 = 30.0;
/// Upper bound of the analysis band; the queue sets 100 on completion
const ANALYSIS_DONE: f32 = 95.0;

pub struct FolderAnalysisJob {
    crawler: Arc<Crawler>,
    analyzer: Arc<dyn Analyzer>,
    results: Arc<AnalysisCache>,
    limits: CrawlLimits,
}

impl FolderAnalysisJob {
    pub fn new(
        crawler: Arc<Crawler>,
        analyzer: Arc<dyn Analyzer>,
        results: Arc<AnalysisCache>,
    ) -> Self {
        let limits = CrawlLimits::from(crawler.config());
        Self {
            crawler,
            analyzer,
            results,
            limits,
        }
    }

    /// Override the crawl budgets taken from the crawler config
    pub fn with_limits(mut self, limits: CrawlLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[async_trait]
impl TaskRunner for FolderAnalysisJob {
    async fn run(&self, ctx: TaskContext) -> Result<GroupingResult> {
        if let Some(cached) = self.results.get(&ctx.folder_id) {
            info!(
                task_id = %ctx.task_id,
                folder_id = %ctx.folder_id,
                "Using cached analysis result"
            );
            return Ok(cached);
        }

        ctx.progress.set(CRAWL_START);
        let crawl = self
            .crawler
            .crawl_report(&ctx.folder_id, self.limits, &ctx.token)
            .await?;
        ctx.progress.set(CRAWL_DONE);

        info!(
            task_id = %ctx.task_id,
            folder_id = %ctx.folder_id,
            files = crawl.files.len(),
            skipped_folders = crawl.skipped_folders,
            "Crawl complete, analyzing"
        );

        let band = ctx.progress.scoped(CRAWL_DONE, ANALYSIS_DONE);
        let mut result = self
            .analyzer
            .analyze(&crawl.files, &band, &ctx.token)
            .await?;
        result.skipped_folders = crawl.skipped_folders;

        // A cancelled run must not leave a result behind for the next submission
        if ctx.token.is_cancelled() {
            return Err(AnalysisError::Cancelled.into());
        }
        // Partial results are returned but never memoized
        if crawl.is_complete() {
            self.results.put(ctx.folder_id.clone(), result.clone());
        } else {
            warn!(
                task_id = %ctx.task_id,
                folder_id = %ctx.folder_id,
                skipped_folders = crawl.skipped_folders,
                "Analysis is partial, not caching it"
            );
        }
        Ok(result)
    }
}
