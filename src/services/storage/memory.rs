//! In-memory storage backend
//!
//! Holds a folder tree in a map and supports fault injection (per-folder
//! throttling, expired credentials, transient failures, latency). Used by
//! the test suite and for dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CredentialRefresher, FileKind, FileNode, ListPage, NodeDetail, StorageProvider};
use crate::error::StorageError;

#[derive(Default)]
struct MemoryState {
    nodes: HashMap<String, FileNode>,
    /// Ordered child ids per folder
    children: HashMap<String, Vec<String>>,
    next_id: u64,
    rate_limited: HashSet<String>,
    broken: HashSet<String>,
    credentials_expired: bool,
    refresh_broken: bool,
    transient_failures: u32,
    latency: Duration,
}

/// Storage provider backed by an in-memory tree
pub struct MemoryStorage {
    root_id: String,
    state: Mutex<MemoryState>,
    list_calls: AtomicU64,
    refreshes: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStorage {
    pub fn new(root_id: &str) -> Self {
        let mut state = MemoryState {
            next_id: 1,
            ..Default::default()
        };
        state.children.insert(root_id.to_string(), Vec::new());
        Self {
            root_id: root_id.to_string(),
            state: Mutex::new(state),
            list_calls: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn add_folder(&self, parent_id: &str, name: &str) -> String {
        let mut state = self.state.lock();
        let id = insert_node(&mut state, parent_id, name, FileKind::Folder, 0);
        state.children.insert(id.clone(), Vec::new());
        id
    }

    pub fn add_file(&self, parent_id: &str, name: &str, size: u64) -> String {
        let mut state = self.state.lock();
        insert_node(&mut state, parent_id, name, FileKind::File, size)
    }

    /// Every listing of this folder answers with a quota error
    pub fn rate_limit_folder(&self, folder_id: &str) {
        self.state.lock().rate_limited.insert(folder_id.to_string());
    }

    /// Lift a quota error installed by [`Self::rate_limit_folder`]
    pub fn unthrottle_folder(&self, folder_id: &str) {
        self.state.lock().rate_limited.remove(folder_id);
    }

    /// Every listing of this folder answers with an unexpected error
    pub fn break_folder(&self, folder_id: &str) {
        self.state.lock().broken.insert(folder_id.to_string());
    }

    /// All calls fail with an auth error until credentials are refreshed
    pub fn expire_credentials(&self) {
        self.state.lock().credentials_expired = true;
    }

    /// Credential refreshes fail
    pub fn break_refresh(&self) {
        self.state.lock().refresh_broken = true;
    }

    /// The next `n` calls fail with a transient error
    pub fn fail_next_calls(&self, n: u32) {
        self.state.lock().transient_failures = n;
    }

    /// Delay applied to every listing call
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Highest number of listing calls observed in flight at once
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn node(&self, id: &str) -> Option<FileNode> {
        self.state.lock().nodes.get(id).cloned()
    }

    /// Names of a folder's direct children, in listing order
    pub fn child_names(&self, folder_id: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .children
            .get(folder_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.nodes.get(id).map(|n| n.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Common fault checks; returns an error if this call should fail
    fn check_faults(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.credentials_expired {
            return Err(StorageError::Auth("access token expired".to_string()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(StorageError::Transient("connection reset".to_string()));
        }
        Ok(())
    }

    fn detach(state: &mut MemoryState, id: &str) {
        let parent = state.nodes.get(id).map(|n| n.parent_id.clone());
        if let Some(parent) = parent {
            if let Some(siblings) = state.children.get_mut(&parent) {
                siblings.retain(|c| c != id);
            }
        }
    }

    fn remove_subtree(state: &mut MemoryState, id: &str) {
        if let Some(children) = state.children.remove(id) {
            for child in children {
                Self::remove_subtree(state, &child);
            }
        }
        state.nodes.remove(id);
    }
}

fn insert_node(
    state: &mut MemoryState,
    parent_id: &str,
    name: &str,
    kind: FileKind,
    size: u64,
) -> String {
    let id = state.next_id.to_string();
    state.next_id += 1;
    state.nodes.insert(
        id.clone(),
        FileNode {
            id: id.clone(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            kind,
            size,
            resolved_path: None,
        },
    );
    state
        .children
        .entry(parent_id.to_string())
        .or_default()
        .push(id.clone());
    id
}

/// Decrements the in-flight counter when a listing call finishes
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn list(
        &self,
        folder_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.check_faults()?;

        let state = self.state.lock();
        if state.rate_limited.contains(folder_id) {
            return Err(StorageError::RateLimited {
                endpoint: "listing".to_string(),
            });
        }
        if state.broken.contains(folder_id) {
            return Err(StorageError::Other(format!("listing of {folder_id} failed")));
        }
        let children = state
            .children
            .get(folder_id)
            .ok_or_else(|| StorageError::NotFound(folder_id.to_string()))?;

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| StorageError::Other(format!("bad cursor {c:?}")))?,
            None => 0,
        };
        let limit = limit.max(1);
        let items: Vec<FileNode> = children
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect();
        let next = offset + limit;
        let next_cursor = (next < children.len()).then(|| next.to_string());

        Ok(ListPage { items, next_cursor })
    }

    async fn detail(&self, id: &str) -> Result<NodeDetail, StorageError> {
        self.check_faults()?;
        if id == self.root_id {
            return Ok(NodeDetail {
                id: id.to_string(),
                name: String::new(),
                parent_id: None,
                kind: FileKind::Folder,
            });
        }
        let state = self.state.lock();
        let node = state
            .nodes
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(NodeDetail {
            id: node.id.clone(),
            name: node.name.clone(),
            parent_id: Some(node.parent_id.clone()),
            kind: node.kind,
        })
    }

    async fn rename(&self, renames: &HashMap<String, String>) -> Result<(), StorageError> {
        self.check_faults()?;
        let mut state = self.state.lock();
        for (id, new_name) in renames {
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| StorageError::NotFound(id.clone()))?;
            node.name = new_name.clone();
        }
        Ok(())
    }

    async fn move_files(&self, ids: &[String], target_folder_id: &str) -> Result<(), StorageError> {
        self.check_faults()?;
        let mut state = self.state.lock();
        if !state.children.contains_key(target_folder_id) {
            return Err(StorageError::NotFound(target_folder_id.to_string()));
        }
        for id in ids {
            if !state.nodes.contains_key(id) {
                return Err(StorageError::NotFound(id.clone()));
            }
            Self::detach(&mut state, id);
            if let Some(node) = state.nodes.get_mut(id) {
                node.parent_id = target_folder_id.to_string();
            }
            state
                .children
                .entry(target_folder_id.to_string())
                .or_default()
                .push(id.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), StorageError> {
        self.check_faults()?;
        let mut state = self.state.lock();
        for id in ids {
            Self::detach(&mut state, id);
            Self::remove_subtree(&mut state, id);
        }
        Ok(())
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, StorageError> {
        self.check_faults()?;
        let mut state = self.state.lock();
        let children = state
            .children
            .get(parent_id)
            .ok_or_else(|| StorageError::NotFound(parent_id.to_string()))?;
        let existing = children.iter().find(|id| {
            state
                .nodes
                .get(*id)
                .is_some_and(|n| n.is_folder() && n.name == name)
        });
        if let Some(id) = existing {
            return Ok(id.clone());
        }
        let id = insert_node(&mut state, parent_id, name, FileKind::Folder, 0);
        state.children.insert(id.clone(), Vec::new());
        Ok(id)
    }
}

#[async_trait]
impl CredentialRefresher for MemoryStorage {
    async fn refresh(&self) -> Result<(), StorageError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.refresh_broken {
            return Err(StorageError::Auth("refresh token revoked".to_string()));
        }
        state.credentials_expired = false;
        Ok(())
    }
}
