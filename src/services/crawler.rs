//! Recursive folder crawler
//!
//! Walks a remote folder tree and collects media files under depth and
//! count budgets. Listings are paginated, rate limited through the storage
//! gateway, cached per folder and single-flighted across concurrent crawls.
//!
//! Root-level subfolders are crawled in small concurrent batches when the
//! root is wide enough to benefit; everything below the root is walked
//! sequentially so request bursts stay within the provider quota.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::{BoxFuture, FutureExt, try_join_all};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CrawlError, ErrorKind};
use crate::services::cache::ListingCache;
use crate::services::path_resolver::{PathResolver, join_path};
use crate::services::request_tracker::FolderRequestTracker;
use crate::services::storage::{FileNode, StorageGateway};

/// Media file extensions we collect
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "flv", "webm", "mpeg", "mpg", "ts", "m2ts", "rmvb",
    "rm", "iso", "vob", "3gp", "mts",
];

pub fn is_media_file(node: &FileNode) -> bool {
    !node.is_folder()
        && node
            .extension()
            .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Crawler tuning
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Default file budget per crawl
    pub max_files: usize,
    /// Default depth budget per crawl (root = 0)
    pub max_depth: usize,
    /// Items requested per listing page
    pub page_size: usize,
    /// Concurrent root-level subfolder crawls, also the batch size
    pub workers: usize,
    /// Fan out only when the root has at least this many subfolders...
    pub parallel_min: usize,
    /// ...and at most this many
    pub parallel_max: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_files: 5000,
            max_depth: 10,
            page_size: 1000,
            workers: 5,
            parallel_min: 20,
            parallel_max: 200,
        }
    }
}

/// Budgets for a single crawl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlLimits {
    pub max_files: usize,
    /// `None` walks the whole tree
    pub max_depth: Option<usize>,
}

impl CrawlLimits {
    pub fn new(max_files: usize, max_depth: usize) -> Self {
        Self {
            max_files,
            max_depth: Some(max_depth),
        }
    }

    pub fn unbounded_depth(max_files: usize) -> Self {
        Self {
            max_files,
            max_depth: None,
        }
    }
}

impl From<&CrawlerConfig> for CrawlLimits {
    fn from(config: &CrawlerConfig) -> Self {
        Self::new(config.max_files, config.max_depth)
    }
}

/// Files collected by one crawl
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub files: Vec<FileNode>,
    /// Folders left out because their listing was throttled or failed
    pub skipped_folders: usize,
}

impl CrawlReport {
    pub fn is_complete(&self) -> bool {
        self.skipped_folders == 0
    }
}

/// Shared accumulator for one crawl
struct CrawlState {
    limits: CrawlLimits,
    token: CancellationToken,
    files: Mutex<Vec<FileNode>>,
    skipped: AtomicUsize,
}

impl CrawlState {
    fn skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn is_full(&self) -> bool {
        self.files.lock().len() >= self.limits.max_files
    }

    /// Add a file unless the budget is exhausted; false once full
    fn push(&self, node: FileNode) -> bool {
        let mut files = self.files.lock();
        if files.len() >= self.limits.max_files {
            return false;
        }
        files.push(node);
        true
    }

    fn checkpoint(&self) -> Result<(), CrawlError> {
        checkpoint(&self.token)
    }
}

/// Fail with [`CrawlError::Cancelled`] if the token has fired
pub fn checkpoint(token: &CancellationToken) -> Result<(), CrawlError> {
    if token.is_cancelled() {
        Err(CrawlError::Cancelled)
    } else {
        Ok(())
    }
}

pub struct Crawler {
    gateway: Arc<StorageGateway>,
    resolver: Arc<PathResolver>,
    listings: Arc<ListingCache>,
    tracker: Arc<FolderRequestTracker>,
    config: CrawlerConfig,
}

impl Crawler {
    pub fn new(
        gateway: Arc<StorageGateway>,
        resolver: Arc<PathResolver>,
        listings: Arc<ListingCache>,
        tracker: Arc<FolderRequestTracker>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            gateway,
            resolver,
            listings,
            tracker,
            config,
        }
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Collect media files under `root_id`
    pub async fn crawl(
        &self,
        root_id: &str,
        limits: CrawlLimits,
        token: &CancellationToken,
    ) -> Result<Vec<FileNode>, CrawlError> {
        Ok(self.crawl_report(root_id, limits, token).await?.files)
    }

    /// Like [`Self::crawl`], also counting the folders that had to be skipped
    pub async fn crawl_report(
        &self,
        root_id: &str,
        limits: CrawlLimits,
        token: &CancellationToken,
    ) -> Result<CrawlReport, CrawlError> {
        checkpoint(token)?;

        let root_path = match self.resolver.resolve(root_id).await {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::Auth => return Err(e.into()),
            Err(e) => {
                warn!(folder_id = %root_id, error = %e, "Could not resolve crawl root path");
                String::new()
            }
        };

        info!(
            folder_id = %root_id,
            path = %root_path,
            max_files = limits.max_files,
            max_depth = ?limits.max_depth,
            "Starting crawl"
        );

        let state = CrawlState {
            limits,
            token: token.clone(),
            files: Mutex::new(Vec::new()),
            skipped: AtomicUsize::new(0),
        };
        self.crawl_folder(&state, root_id.to_string(), root_path, 0)
            .await?;

        let report = CrawlReport {
            files: state.files.into_inner(),
            skipped_folders: state.skipped.into_inner(),
        };
        if report.is_complete() {
            info!(folder_id = %root_id, files = report.files.len(), "Crawl finished");
        } else {
            warn!(
                folder_id = %root_id,
                files = report.files.len(),
                skipped_folders = report.skipped_folders,
                "Crawl finished with skipped folders"
            );
        }
        Ok(report)
    }

    /// Crawl without a depth budget
    pub async fn crawl_all(
        &self,
        root_id: &str,
        max_files: usize,
        token: &CancellationToken,
    ) -> Result<Vec<FileNode>, CrawlError> {
        self.crawl(root_id, CrawlLimits::unbounded_depth(max_files), token)
            .await
    }

    fn should_fan_out(&self, subfolders: usize) -> bool {
        self.config.workers > 1
            && subfolders >= self.config.parallel_min
            && subfolders <= self.config.parallel_max
    }

    fn crawl_folder<'a>(
        &'a self,
        state: &'a CrawlState,
        folder_id: String,
        folder_path: String,
        depth: usize,
    ) -> BoxFuture<'a, Result<(), CrawlError>> {
        async move {
            state.checkpoint()?;
            if state.is_full() {
                return Ok(());
            }

            let entries = match self.list_folder(&folder_id, &state.token).await {
                Ok(entries) => entries,
                Err(CrawlError::Cancelled) => return Err(CrawlError::Cancelled),
                Err(CrawlError::Storage(e)) if e.is_rate_limited() => {
                    warn!(
                        folder_id = %folder_id,
                        path = %folder_path,
                        "Listing rate limited, skipping folder"
                    );
                    state.skip();
                    return Ok(());
                }
                Err(CrawlError::Storage(e)) if e.kind() == ErrorKind::Auth => {
                    return Err(CrawlError::Storage(e));
                }
                Err(CrawlError::Storage(e)) => {
                    warn!(
                        folder_id = %folder_id,
                        path = %folder_path,
                        error = %e,
                        "Listing failed, abandoning branch"
                    );
                    state.skip();
                    return Ok(());
                }
            };

            let mut subfolders = Vec::new();
            for entry in entries.iter() {
                if entry.is_folder() {
                    subfolders.push(entry);
                    continue;
                }
                if !is_media_file(entry) {
                    continue;
                }
                let mut node = entry.clone();
                node.resolved_path = Some(join_path(&folder_path, &node.name));
                if !state.push(node) {
                    debug!(folder_id = %folder_id, "File budget reached");
                    return Ok(());
                }
            }

            debug!(
                folder_id = %folder_id,
                depth,
                entries = entries.len(),
                subfolders = subfolders.len(),
                "Listed folder"
            );

            if subfolders.is_empty() {
                return Ok(());
            }
            if state.limits.max_depth.is_some_and(|max| depth >= max) {
                return Ok(());
            }

            let children: Vec<(String, String)> = subfolders
                .iter()
                .map(|folder| {
                    let path = self
                        .resolver
                        .remember(&folder.id, &join_path(&folder_path, &folder.name));
                    (folder.id.clone(), path)
                })
                .collect();

            if depth == 0 && self.should_fan_out(children.len()) {
                return self.crawl_batched(state, children, depth + 1).await;
            }

            for (child_id, child_path) in children {
                if state.is_full() {
                    break;
                }
                self.crawl_folder(state, child_id, child_path, depth + 1)
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Crawl sibling folders in batches of `workers` concurrent branches
    async fn crawl_batched(
        &self,
        state: &CrawlState,
        children: Vec<(String, String)>,
        depth: usize,
    ) -> Result<(), CrawlError> {
        let batch_size = self.config.workers.max(1);
        info!(
            subfolders = children.len(),
            batch_size,
            "Crawling root subfolders concurrently"
        );

        for batch in children.chunks(batch_size) {
            state.checkpoint()?;
            if state.is_full() {
                break;
            }
            let branches = batch
                .iter()
                .map(|(id, path)| self.crawl_folder(state, id.clone(), path.clone(), depth));
            // First cancellation drops every sibling still in flight
            try_join_all(branches).await?;
        }
        Ok(())
    }

    /// Direct children of a folder, served from the listing cache when fresh
    pub async fn list_children(
        &self,
        folder_id: &str,
        token: &CancellationToken,
    ) -> Result<Arc<Vec<FileNode>>, CrawlError> {
        self.list_folder(folder_id, token).await
    }

    /// All entries of one folder, from cache or by walking every page
    async fn list_folder(
        &self,
        folder_id: &str,
        token: &CancellationToken,
    ) -> Result<Arc<Vec<FileNode>>, CrawlError> {
        let key = folder_id.to_string();
        if let Some(cached) = self.listings.get(&key) {
            return Ok(cached);
        }

        let _guard = self.tracker.acquire(&format!("list:{folder_id}")).await;
        if let Some(cached) = self.listings.get(&key) {
            return Ok(cached);
        }

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            checkpoint(token)?;
            let page = self
                .gateway
                .list(folder_id, self.config.page_size, cursor.as_deref())
                .await?;
            items.extend(page.items);
            checkpoint(token)?;

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        let listing = Arc::new(items);
        self.listings.put(key, listing.clone());
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::BoundedCache;
    use crate::services::rate_limiter::{EndpointLimiters, EndpointQuotas};
    use crate::services::retry::RetryPolicy;
    use crate::services::storage::MemoryStorage;
    use std::time::Duration;

    fn crawler(storage: Arc<MemoryStorage>, config: CrawlerConfig) -> Crawler {
        let gateway = Arc::new(StorageGateway::new(
            storage,
            EndpointLimiters::new(&EndpointQuotas::uniform(10_000.0)),
            RetryPolicy::none(),
        ));
        let tracker = Arc::new(FolderRequestTracker::new());
        let paths = Arc::new(BoundedCache::new("path", 1000, Duration::from_secs(60)));
        let listings = Arc::new(BoundedCache::new("listing", 1000, Duration::from_secs(60)));
        let resolver = Arc::new(PathResolver::new(gateway.clone(), paths, tracker.clone(), "0"));
        Crawler::new(gateway, resolver, listings, tracker, config)
    }

    #[test]
    fn test_media_filter() {
        let node = |name: &str| FileNode {
            id: "1".into(),
            parent_id: "0".into(),
            name: name.into(),
            kind: crate::services::storage::FileKind::File,
            size: 0,
            resolved_path: None,
        };
        assert!(is_media_file(&node("a.MKV")));
        assert!(!is_media_file(&node("a.nfo")));
        assert!(!is_media_file(&node("README")));
    }

    #[tokio::test]
    async fn test_paths_and_pagination() {
        let storage = Arc::new(MemoryStorage::new("0"));
        let shows = storage.add_folder("0", "Shows");
        for i in 0..7 {
            storage.add_file(&shows, &format!("ep{i}.mkv"), 100);
        }
        storage.add_file(&shows, "cover.jpg", 5);

        let config = CrawlerConfig {
            page_size: 3,
            ..CrawlerConfig::default()
        };
        let crawler = crawler(storage.clone(), config);
        let files = crawler
            .crawl("0", CrawlLimits::new(100, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(files.len(), 7);
        assert_eq!(files[0].resolved_path.as_deref(), Some("/Shows/ep0.mkv"));
        // root: 1 page, Shows: 3 pages
        assert_eq!(storage.list_calls(), 4);
    }

    #[tokio::test]
    async fn test_listing_cache_is_reused() {
        let storage = Arc::new(MemoryStorage::new("0"));
        storage.add_file("0", "a.mkv", 1);
        let crawler = crawler(storage.clone(), CrawlerConfig::default());
        let token = CancellationToken::new();

        crawler.crawl("0", CrawlLimits::new(10, 1), &token).await.unwrap();
        crawler.crawl("0", CrawlLimits::new(10, 1), &token).await.unwrap();
        assert_eq!(storage.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_immediately() {
        let storage = Arc::new(MemoryStorage::new("0"));
        storage.add_file("0", "a.mkv", 1);
        let crawler = crawler(storage.clone(), CrawlerConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let err = crawler.crawl("0", CrawlLimits::new(10, 1), &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(storage.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_broken_branch_does_not_abort_siblings() {
        let storage = Arc::new(MemoryStorage::new("0"));
        let bad = storage.add_folder("0", "bad");
        let good = storage.add_folder("0", "good");
        storage.add_file(&bad, "lost.mkv", 1);
        storage.add_file(&good, "kept.mkv", 1);
        storage.break_folder(&bad);

        let crawler = crawler(storage, CrawlerConfig::default());
        let report = crawler
            .crawl_report("0", CrawlLimits::new(10, 3), &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<_> = report.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["kept.mkv"]);
        assert_eq!(report.skipped_folders, 1);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_crawl() {
        let storage = Arc::new(MemoryStorage::new("0"));
        storage.add_folder("0", "a");
        storage.expire_credentials();

        let crawler = crawler(storage, CrawlerConfig::default());
        let err = crawler
            .crawl("0", CrawlLimits::new(10, 3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Storage(e) if e.kind() == ErrorKind::Auth));
    }

    #[test]
    fn test_fan_out_band() {
        let storage = Arc::new(MemoryStorage::new("0"));
        let crawler = crawler(storage, CrawlerConfig::default());
        assert!(!crawler.should_fan_out(19));
        assert!(crawler.should_fan_out(20));
        assert!(crawler.should_fan_out(200));
        assert!(!crawler.should_fan_out(201));
    }
}
