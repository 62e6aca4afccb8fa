//! Core services: caches, rate limiting, storage access, crawling and the task queue

pub mod analysis;
pub mod cache;
pub mod crawler;
pub mod filename_parser;
pub mod folder_job;
pub mod logging;
pub mod maintenance;
pub mod organizer;
pub mod path_resolver;
pub mod rate_limiter;
pub mod request_tracker;
pub mod retry;
pub mod storage;
pub mod task_queue;

pub use analysis::{Analyzer, FileGroup, FilenameGrouper, GroupingResult, ProgressSink};
pub use cache::{BoundedCache, CacheConfig, CacheRegistry, CacheStats};
pub use crawler::{CrawlLimits, CrawlReport, Crawler, CrawlerConfig};
pub use folder_job::FolderAnalysisJob;
pub use organizer::{OrganizePlan, OrganizeReport, Organizer};
pub use path_resolver::PathResolver;
pub use rate_limiter::{Endpoint, EndpointLimiters, EndpointQuotas, RateLimiter};
pub use request_tracker::FolderRequestTracker;
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{
    CredentialRefresher, FileKind, FileNode, LocalStorage, MemoryStorage, StorageGateway,
    StorageProvider,
};
pub use task_queue::{
    QueueHealth, QueueInfo, Task, TaskContext, TaskQueueConfig, TaskQueueManager, TaskRunner,
    TaskStatus,
};
