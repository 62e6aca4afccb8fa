//! Cloud storage collaborators
//!
//! [`StorageProvider`] is the narrow contract the crawler, path resolver and
//! organizer need from a storage backend. [`StorageGateway`] wraps a provider
//! with per-endpoint rate limiting and the retry policy; nothing else talks
//! to a provider directly.

pub mod local;
pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::services::rate_limiter::{Endpoint, EndpointLimiters};
use crate::services::retry::{RetryDecision, RetryPolicy};

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// File or folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

/// One entry returned by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    /// Full human-readable path, filled in by the crawler; derived, not authoritative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
}

impl FileNode {
    pub fn is_folder(&self) -> bool {
        self.kind == FileKind::Folder
    }

    /// Lowercased extension without the dot
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }
}

/// One page of a folder listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<FileNode>,
    /// Cursor for the next page; `None` when the listing is exhausted
    pub next_cursor: Option<String>,
}

/// Metadata needed to walk parent links
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDetail {
    pub id: String,
    pub name: String,
    /// `None` for the storage root
    pub parent_id: Option<String>,
    pub kind: FileKind,
}

/// Operations a storage backend must provide
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// List one page of a folder's direct children
    async fn list(
        &self,
        folder_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage, StorageError>;

    async fn detail(&self, id: &str) -> Result<NodeDetail, StorageError>;

    /// Rename entries; keys are ids, values are new names
    async fn rename(&self, renames: &HashMap<String, String>) -> Result<(), StorageError>;

    async fn move_files(&self, ids: &[String], target_folder_id: &str) -> Result<(), StorageError>;

    async fn delete(&self, ids: &[String]) -> Result<(), StorageError>;

    /// Create a folder, or return the id of an existing folder with the same name
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, StorageError>;
}

/// Refreshes provider credentials after an auth failure
#[async_trait]
pub trait CredentialRefresher: Send + Sync + 'static {
    async fn refresh(&self) -> Result<(), StorageError>;
}

/// Rate-limited, retrying front door to a [`StorageProvider`]
pub struct StorageGateway {
    provider: Arc<dyn StorageProvider>,
    limiters: EndpointLimiters,
    retry: RetryPolicy,
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl StorageGateway {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        limiters: EndpointLimiters,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            limiters,
            retry,
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn limiters(&self) -> &EndpointLimiters {
        &self.limiters
    }

    pub async fn list(
        &self,
        folder_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        self.call(Endpoint::Listing, || self.provider.list(folder_id, limit, cursor))
            .await
    }

    pub async fn detail(&self, id: &str) -> Result<NodeDetail, StorageError> {
        self.call(Endpoint::Detail, || self.provider.detail(id)).await
    }

    pub async fn rename(&self, renames: &HashMap<String, String>) -> Result<(), StorageError> {
        if renames.is_empty() {
            return Ok(());
        }
        self.call(Endpoint::Rename, || self.provider.rename(renames)).await
    }

    pub async fn move_files(
        &self,
        ids: &[String],
        target_folder_id: &str,
    ) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call(Endpoint::Move, || self.provider.move_files(ids, target_folder_id))
            .await
    }

    pub async fn delete(&self, ids: &[String]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call(Endpoint::Delete, || self.provider.delete(ids)).await
    }

    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, StorageError> {
        self.call(Endpoint::CreateFolder, || self.provider.create_folder(name, parent_id))
            .await
    }

    /// Run one provider call under the endpoint's limiter, applying the retry policy
    async fn call<T, F, Fut>(&self, endpoint: Endpoint, operation: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        let mut refreshes = 0;

        loop {
            attempt += 1;
            self.limiters.acquire(endpoint).await;

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.retry.decide(&err, attempt, refreshes) {
                RetryDecision::RefreshCredentials => {
                    let Some(refresher) = &self.refresher else {
                        return Err(err);
                    };
                    refreshes += 1;
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        error = %err,
                        "Credentials rejected, refreshing"
                    );
                    if let Err(refresh_err) = refresher.refresh().await {
                        return Err(StorageError::Auth(format!(
                            "credential refresh failed: {refresh_err}"
                        )));
                    }
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Storage call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    debug!(endpoint = %endpoint, attempt, error = %err, "Storage call failed");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rate_limiter::EndpointQuotas;
    use std::time::Duration;

    fn gateway(storage: Arc<MemoryStorage>, retry: RetryPolicy) -> StorageGateway {
        StorageGateway::new(
            storage.clone(),
            EndpointLimiters::new(&EndpointQuotas::uniform(1000.0)),
            retry,
        )
        .with_refresher(storage)
    }

    #[test]
    fn test_extension_is_lowercased() {
        let node = FileNode {
            id: "1".into(),
            parent_id: "0".into(),
            name: "Movie.MKV".into(),
            kind: FileKind::File,
            size: 1,
            resolved_path: None,
        };
        assert_eq!(node.extension().as_deref(), Some("mkv"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_refreshed_and_retried() {
        let storage = Arc::new(MemoryStorage::new("0"));
        storage.add_file("0", "a.mkv", 10);
        storage.expire_credentials();

        let gw = gateway(storage.clone(), RetryPolicy::default());
        let page = gw.list("0", 100, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(storage.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_a_hard_auth_error() {
        let storage = Arc::new(MemoryStorage::new("0"));
        storage.expire_credentials();
        storage.break_refresh();

        let gw = gateway(storage, RetryPolicy::default());
        let err = gw.list("0", 100, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Auth(msg) if msg.contains("refresh failed")));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let storage = Arc::new(MemoryStorage::new("0"));
        storage.fail_next_calls(2);

        let retry = RetryPolicy {
            delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        let gw = gateway(storage.clone(), retry);
        assert!(gw.list("0", 100, None).await.is_ok());
        assert_eq!(storage.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_is_not_retried() {
        let storage = Arc::new(MemoryStorage::new("0"));
        storage.rate_limit_folder("0");

        let gw = gateway(storage.clone(), RetryPolicy::default());
        let err = gw.list("0", 100, None).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(storage.list_calls(), 1);
    }
}
