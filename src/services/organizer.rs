//! Applies a grouping to remote storage
//!
//! For every group the organizer:
//! - creates (or reuses) a folder named after the group under the target parent
//! - moves the group's files there in chunks
//! - applies any requested renames
//!
//! Every folder touched along the way has its cached listing and analysis
//! result dropped. Failures are recorded per group and never abort the
//! remaining groups.
//!
//! The organizer also prunes subfolders that hold no media files.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CrawlError, StorageError};
use crate::services::analysis::GroupingResult;
use crate::services::cache::CacheRegistry;
use crate::services::crawler::{CrawlLimits, Crawler, checkpoint};
use crate::services::storage::StorageGateway;

/// Files moved per provider call
const DEFAULT_MOVE_CHUNK: usize = 100;

/// One folder to create and fill
#[derive(Debug, Clone, Default)]
pub struct PlannedGroup {
    pub folder_name: String,
    pub file_ids: Vec<String>,
    /// Folders the files are moved out of
    pub source_folder_ids: Vec<String>,
    /// File id -> new file name
    pub renames: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct OrganizePlan {
    /// Folder the group folders are created in
    pub target_parent_id: String,
    /// Folder that was analyzed to produce the plan, if any
    pub analyzed_folder_id: Option<String>,
    pub groups: Vec<PlannedGroup>,
}

impl OrganizePlan {
    /// One group folder per analysis group, created under the analyzed folder
    pub fn from_result(folder_id: &str, result: &GroupingResult) -> Self {
        let groups = result
            .groups
            .iter()
            .filter(|g| !g.file_ids.is_empty())
            .map(|g| PlannedGroup {
                folder_name: folder_name_for(&g.name),
                file_ids: g.file_ids.clone(),
                source_folder_ids: g.parent_ids.clone(),
                renames: HashMap::new(),
            })
            .collect();
        Self {
            target_parent_id: folder_id.to_string(),
            analyzed_folder_id: Some(folder_id.to_string()),
            groups,
        }
    }
}

/// Storage providers reject path separators in names
fn folder_name_for(group_name: &str) -> String {
    let name: String = group_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '-' } else { c })
        .collect();
    let name = name.trim();
    if name.is_empty() {
        "Unsorted".to_string()
    } else {
        name.to_string()
    }
}

/// What happened to one planned group
#[derive(Debug, Clone, Serialize)]
pub struct GroupOutcome {
    pub folder_name: String,
    pub folder_id: Option<String>,
    pub moved: usize,
    pub renamed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrganizeReport {
    pub groups: Vec<GroupOutcome>,
    pub moved: usize,
    pub renamed: usize,
    pub failed: usize,
}

impl OrganizeReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

pub struct Organizer {
    gateway: Arc<StorageGateway>,
    caches: Arc<CacheRegistry>,
    move_chunk: usize,
}

impl Organizer {
    pub fn new(gateway: Arc<StorageGateway>, caches: Arc<CacheRegistry>) -> Self {
        Self {
            gateway,
            caches,
            move_chunk: DEFAULT_MOVE_CHUNK,
        }
    }

    pub fn with_move_chunk(mut self, move_chunk: usize) -> Self {
        self.move_chunk = move_chunk.max(1);
        self
    }

    /// Apply a plan group by group
    pub async fn apply(&self, plan: &OrganizePlan) -> OrganizeReport {
        info!(
            target_parent_id = %plan.target_parent_id,
            groups = plan.groups.len(),
            "Organizing files"
        );

        let mut report = OrganizeReport::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();
        touched.insert(plan.target_parent_id.clone());
        if let Some(analyzed) = &plan.analyzed_folder_id {
            touched.insert(analyzed.clone());
        }

        for group in &plan.groups {
            touched.extend(group.source_folder_ids.iter().cloned());

            let mut outcome = GroupOutcome {
                folder_name: group.folder_name.clone(),
                folder_id: None,
                moved: 0,
                renamed: 0,
                error: None,
            };
            if let Err(e) = self
                .apply_group(&plan.target_parent_id, group, &mut outcome)
                .await
            {
                warn!(folder_name = %group.folder_name, error = %e, "Failed to organize group");
                outcome.error = Some(e.to_string());
                report.failed += 1;
            }
            if let Some(folder_id) = &outcome.folder_id {
                touched.insert(folder_id.clone());
            }
            report.moved += outcome.moved;
            report.renamed += outcome.renamed;
            report.groups.push(outcome);
        }

        for folder_id in &touched {
            self.caches.invalidate_folder(folder_id);
        }
        debug!(folders = touched.len(), "Invalidated cached folders");

        info!(
            moved = report.moved,
            renamed = report.renamed,
            failed = report.failed,
            "Organize finished"
        );
        report
    }

    async fn apply_group(
        &self,
        parent_id: &str,
        group: &PlannedGroup,
        outcome: &mut GroupOutcome,
    ) -> Result<(), StorageError> {
        let folder_id = self
            .gateway
            .create_folder(&group.folder_name, parent_id)
            .await?;
        outcome.folder_id = Some(folder_id.clone());

        // Files already in place only need their renames
        let in_place = !group.source_folder_ids.is_empty()
            && group.source_folder_ids.iter().all(|src| *src == folder_id);
        if !in_place {
            for chunk in group.file_ids.chunks(self.move_chunk) {
                self.gateway.move_files(chunk, &folder_id).await?;
                outcome.moved += chunk.len();
            }
        }

        if !group.renames.is_empty() {
            self.gateway.rename(&group.renames).await?;
            outcome.renamed = group.renames.len();
        }
        Ok(())
    }

    /// Delete entries from `parent_id` and drop its cached listing
    pub async fn delete(&self, ids: &[String], parent_id: &str) -> Result<usize, StorageError> {
        let result = self.gateway.delete(ids).await;
        // Partial deletes are possible, so invalidate either way
        self.caches.invalidate_folder(parent_id);
        for id in ids {
            self.caches.invalidate_folder(id);
            self.caches.invalidate_path(id);
        }
        result?;
        info!(parent_id = %parent_id, deleted = ids.len(), "Deleted entries");
        Ok(ids.len())
    }

    /// Delete the subfolders of `parent_id` that contain no media files at any depth
    ///
    /// A subfolder whose crawl skipped part of its tree is kept, since the
    /// unlisted part may hold media. Returns the number of folders deleted.
    pub async fn delete_empty_folders(
        &self,
        crawler: &Crawler,
        parent_id: &str,
        token: &CancellationToken,
    ) -> Result<usize, CrawlError> {
        let children = crawler.list_children(parent_id, token).await?;

        let mut empty = Vec::new();
        for folder in children.iter().filter(|c| c.is_folder()) {
            // One media file is enough to keep the folder
            let report = crawler
                .crawl_report(&folder.id, CrawlLimits::unbounded_depth(1), token)
                .await?;
            if report.files.is_empty() && report.is_complete() {
                debug!(folder_id = %folder.id, name = %folder.name, "Folder has no media files");
                empty.push(folder.id.clone());
            } else if !report.is_complete() {
                warn!(
                    folder_id = %folder.id,
                    name = %folder.name,
                    "Folder only partly listed, keeping it"
                );
            }
        }

        if empty.is_empty() {
            info!(parent_id = %parent_id, "No empty folders to delete");
            return Ok(0);
        }
        checkpoint(token)?;
        Ok(self.delete(&empty, parent_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analysis::FileGroup;
    use crate::services::cache::CacheConfig;
    use crate::services::rate_limiter::{EndpointLimiters, EndpointQuotas};
    use crate::services::retry::RetryPolicy;
    use crate::services::storage::MemoryStorage;
    use std::time::Duration;

    fn registry() -> Arc<CacheRegistry> {
        let config = |name: &str| CacheConfig {
            name: name.to_string(),
            capacity: 10,
            ttl: Duration::from_secs(60),
        };
        Arc::new(CacheRegistry::new(&config("path"), &config("listing"), &config("analysis")))
    }

    fn organizer(storage: Arc<MemoryStorage>, caches: Arc<CacheRegistry>) -> Organizer {
        let gateway = Arc::new(StorageGateway::new(
            storage,
            EndpointLimiters::new(&EndpointQuotas::uniform(1000.0)),
            RetryPolicy::none(),
        ));
        Organizer::new(gateway, caches)
    }

    #[test]
    fn test_folder_name_strips_separators() {
        assert_eq!(folder_name_for("AC/DC Live"), "AC-DC Live");
        assert_eq!(folder_name_for("  "), "Unsorted");
    }

    #[tokio::test]
    async fn test_apply_moves_files_and_invalidates() {
        let storage = Arc::new(MemoryStorage::new("0"));
        let a = storage.add_file("0", "Heat.1995.mkv", 1);
        let b = storage.add_file("0", "Heat.1995.part2.mkv", 1);
        let caches = registry();
        caches.listings.put("0".to_string(), Arc::new(Vec::new()));
        caches.analysis.put("0".to_string(), GroupingResult::empty());

        let result = GroupingResult {
            groups: vec![FileGroup {
                name: "Heat (1995)".into(),
                file_ids: vec![a.clone(), b.clone()],
                file_names: vec![],
                parent_ids: vec!["0".into()],
                total_size: 2,
            }],
            ..GroupingResult::empty()
        };
        let plan = OrganizePlan::from_result("0", &result);
        let report = organizer(storage.clone(), caches.clone())
            .with_move_chunk(1)
            .apply(&plan)
            .await;

        assert!(report.is_success());
        assert_eq!(report.moved, 2);
        assert_eq!(storage.child_names("0"), vec!["Heat (1995)"]);
        let folder = report.groups[0].folder_id.clone().unwrap();
        assert_eq!(storage.node(&a).unwrap().parent_id, folder);
        assert_eq!(caches.listings.size(), 0);
        assert_eq!(caches.analysis.size(), 0);
    }

    #[tokio::test]
    async fn test_failed_group_does_not_stop_others() {
        let storage = Arc::new(MemoryStorage::new("0"));
        let ok = storage.add_file("0", "good.mkv", 1);
        let plan = OrganizePlan {
            target_parent_id: "0".into(),
            analyzed_folder_id: None,
            groups: vec![
                PlannedGroup {
                    folder_name: "Missing".into(),
                    file_ids: vec!["999".into()],
                    source_folder_ids: vec!["0".into()],
                    ..Default::default()
                },
                PlannedGroup {
                    folder_name: "Good".into(),
                    file_ids: vec![ok.clone()],
                    source_folder_ids: vec!["0".into()],
                    ..Default::default()
                },
            ],
        };
        let report = organizer(storage.clone(), registry()).apply(&plan).await;

        assert_eq!(report.failed, 1);
        assert!(report.groups[0].error.is_some());
        assert_eq!(report.groups[1].moved, 1);
    }

    #[tokio::test]
    async fn test_delete_invalidates_parent() {
        let storage = Arc::new(MemoryStorage::new("0"));
        let f = storage.add_file("0", "junk.nfo", 1);
        let caches = registry();
        caches.listings.put("0".to_string(), Arc::new(Vec::new()));

        let deleted = organizer(storage.clone(), caches.clone())
            .delete(&[f], "0")
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(storage.child_names("0").is_empty());
        assert_eq!(caches.listings.size(), 0);
    }
}
