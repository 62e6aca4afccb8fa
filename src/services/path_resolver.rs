//! Folder path resolution
//!
//! Builds `/A/B/C` style paths by walking parent links through the storage
//! detail endpoint. Every ancestor computed on the way is cached, and
//! concurrent resolutions of the same folder are single-flighted, so a path
//! is fetched at most once per cache lifetime.

use std::sync::Arc;

use tracing::debug;

use crate::error::StorageError;
use crate::services::cache::PathCache;
use crate::services::request_tracker::FolderRequestTracker;
use crate::services::storage::StorageGateway;

/// Parent links followed before giving up on a path
const MAX_PATH_HOPS: usize = 64;

/// Join a folder path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub struct PathResolver {
    gateway: Arc<StorageGateway>,
    cache: Arc<PathCache>,
    tracker: Arc<FolderRequestTracker>,
    root_id: String,
}

impl PathResolver {
    pub fn new(
        gateway: Arc<StorageGateway>,
        cache: Arc<PathCache>,
        tracker: Arc<FolderRequestTracker>,
        root_id: &str,
    ) -> Self {
        Self {
            gateway,
            cache,
            tracker,
            root_id: root_id.to_string(),
        }
    }

    /// Full path of a folder; `/` for the root
    pub async fn resolve(&self, folder_id: &str) -> Result<String, StorageError> {
        if folder_id == self.root_id {
            return Ok("/".to_string());
        }
        if let Some(path) = self.cache.get(&folder_id.to_string()) {
            return Ok(path);
        }

        let _guard = self.tracker.acquire(&format!("path:{folder_id}")).await;
        // Another caller may have finished while we waited
        if let Some(path) = self.cache.get(&folder_id.to_string()) {
            return Ok(path);
        }

        let mut chain: Vec<(String, String)> = Vec::new();
        let mut current = folder_id.to_string();
        let base = loop {
            if current == self.root_id {
                break String::new();
            }
            if let Some(path) = self.cache.get(&current) {
                break path;
            }
            if chain.len() >= MAX_PATH_HOPS || chain.iter().any(|(id, _)| *id == current) {
                return Err(StorageError::Other(format!(
                    "parent chain of {folder_id} is too deep or cyclic"
                )));
            }

            let detail = self.gateway.detail(&current).await?;
            let parent = detail.parent_id;
            chain.push((current, detail.name));
            match parent {
                Some(parent) => current = parent,
                None => break String::new(),
            }
        };

        debug!(folder_id = %folder_id, hops = chain.len(), "Resolved folder path");

        let mut path = base;
        for (id, name) in chain.into_iter().rev() {
            path = join_path(&path, &name);
            path = self.cache.get_or_insert_with(id, || path.clone());
        }
        Ok(path)
    }

    /// Record a path learned from a listing. Returns the cached path, which
    /// wins if another caller stored one first.
    pub fn remember(&self, folder_id: &str, path: &str) -> String {
        self.cache
            .get_or_insert_with(folder_id.to_string(), || path.to_string())
    }

    pub fn forget(&self, folder_id: &str) {
        self.cache.delete(&folder_id.to_string());
    }
}
