//! Grouping analysis over crawled files
//!
//! The analysis routine is pluggable through [`Analyzer`]; the task queue
//! only needs it to honour the cancellation token and to report progress
//! messages of the form `"<label> i/n"`. [`FilenameGrouper`] is the shipped
//! implementation and groups files by the title parsed from their names.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AnalysisError;
use crate::services::filename_parser::parse_title;
use crate::services::storage::FileNode;

/// Receives progress messages from the analysis routine
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

/// A set of files that belong together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    /// Suggested folder name
    pub name: String,
    pub file_ids: Vec<String>,
    pub file_names: Vec<String>,
    /// Folders the files currently live in
    pub parent_ids: Vec<String>,
    pub total_size: u64,
}

/// Outcome of analyzing one folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingResult {
    pub success: bool,
    /// Number of media files analyzed
    pub count: usize,
    pub total_size: u64,
    /// `total_size` formatted for display
    pub size: String,
    pub groups: Vec<FileGroup>,
    /// Folders the crawl could not list; non-zero means the counts are partial
    #[serde(default)]
    pub skipped_folders: usize,
}

impl GroupingResult {
    pub fn empty() -> Self {
        Self {
            success: true,
            count: 0,
            total_size: 0,
            size: format_size(0),
            groups: Vec::new(),
            skipped_folders: 0,
        }
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    async fn analyze(
        &self,
        files: &[FileNode],
        progress: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> Result<GroupingResult, AnalysisError>;
}

/// Groups files whose parsed titles normalize to the same key
pub struct FilenameGrouper {
    batch_size: usize,
}

impl FilenameGrouper {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl Default for FilenameGrouper {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl Analyzer for FilenameGrouper {
    async fn analyze(
        &self,
        files: &[FileNode],
        progress: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> Result<GroupingResult, AnalysisError> {
        let mut groups: Vec<FileGroup> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let batches = files.len().div_ceil(self.batch_size);

        for (i, batch) in files.chunks(self.batch_size).enumerate() {
            if token.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }

            for file in batch {
                let parsed = parse_title(&file.name);
                let slot = *index.entry(parsed.group_key()).or_insert_with(|| {
                    groups.push(FileGroup {
                        name: parsed.display_name(),
                        file_ids: Vec::new(),
                        file_names: Vec::new(),
                        parent_ids: Vec::new(),
                        total_size: 0,
                    });
                    groups.len() - 1
                });
                let group = &mut groups[slot];
                group.file_ids.push(file.id.clone());
                group.file_names.push(file.name.clone());
                if !group.parent_ids.contains(&file.parent_id) {
                    group.parent_ids.push(file.parent_id.clone());
                }
                group.total_size += file.size;
            }

            progress.report(&format!("batch {}/{}", i + 1, batches));
            tokio::task::yield_now().await;
        }

        let total_size: u64 = files.iter().map(|f| f.size).sum();
        debug!(files = files.len(), groups = groups.len(), "Grouped files by title");

        Ok(GroupingResult {
            success: true,
            count: files.len(),
            total_size,
            size: format_size(total_size),
            groups,
            skipped_folders: 0,
        })
    }
}

/// Format a byte count as "1.5 GB"
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
