//! Local directory served through the storage contract
//!
//! Folder and file ids are paths relative to the root directory, using `/`
//! separators; the root itself answers to the configured root id. Cursors
//! are page offsets into the name-sorted directory listing.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{FileKind, FileNode, ListPage, NodeDetail, StorageProvider};
use crate::error::StorageError;

/// Storage provider over a directory on disk
pub struct LocalStorage {
    root: PathBuf,
    root_id: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, root_id: &str) -> Self {
        Self {
            root: root.into(),
            root_id: root_id.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an id to a path under the root, rejecting anything that escapes it
    fn resolve(&self, id: &str) -> Result<PathBuf, StorageError> {
        if id == self.root_id || id.is_empty() {
            return Ok(self.root.clone());
        }
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::Other(format!("invalid id {id:?}")));
        }
        Ok(self.root.join(relative))
    }

    fn child_id(&self, parent_id: &str, name: &str) -> String {
        if parent_id == self.root_id || parent_id.is_empty() {
            name.to_string()
        } else {
            format!("{parent_id}/{name}")
        }
    }

    fn parent_of(&self, id: &str) -> String {
        match id.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => self.root_id.clone(),
        }
    }

    fn check_name(name: &str) -> Result<(), StorageError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(StorageError::Other(format!("invalid name {name:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn list(
        &self,
        folder_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let dir = self.resolve(folder_id)?;
        let mut reader = fs::read_dir(&dir).await?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(FileNode {
                id: self.child_id(folder_id, &name),
                parent_id: folder_id.to_string(),
                kind: if metadata.is_dir() {
                    FileKind::Folder
                } else {
                    FileKind::File
                },
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                name,
                resolved_path: None,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| StorageError::Other(format!("bad cursor {c:?}")))?,
            None => 0,
        };
        let limit = limit.max(1);
        let total = entries.len();
        let items: Vec<FileNode> = entries.into_iter().skip(offset).take(limit).collect();
        let next = offset + limit;

        Ok(ListPage {
            items,
            next_cursor: (next < total).then(|| next.to_string()),
        })
    }

    async fn detail(&self, id: &str) -> Result<NodeDetail, StorageError> {
        let path = self.resolve(id)?;
        let metadata = fs::metadata(&path).await?;
        let kind = if metadata.is_dir() {
            FileKind::Folder
        } else {
            FileKind::File
        };

        if id == self.root_id || id.is_empty() {
            return Ok(NodeDetail {
                id: self.root_id.clone(),
                name: String::new(),
                parent_id: None,
                kind,
            });
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(NodeDetail {
            id: id.to_string(),
            name,
            parent_id: Some(self.parent_of(id)),
            kind,
        })
    }

    async fn rename(&self, renames: &HashMap<String, String>) -> Result<(), StorageError> {
        for (id, new_name) in renames {
            Self::check_name(new_name)?;
            let from = self.resolve(id)?;
            let to = match from.parent() {
                Some(parent) => parent.join(new_name),
                None => return Err(StorageError::Other(format!("cannot rename {id:?}"))),
            };
            debug!(from = %from.display(), to = %to.display(), "Renaming");
            fs::rename(&from, &to).await?;
        }
        Ok(())
    }

    async fn move_files(&self, ids: &[String], target_folder_id: &str) -> Result<(), StorageError> {
        let target = self.resolve(target_folder_id)?;
        if !fs::metadata(&target).await?.is_dir() {
            return Err(StorageError::Other(format!(
                "move target {target_folder_id:?} is not a folder"
            )));
        }
        for id in ids {
            let from = self.resolve(id)?;
            let name = from
                .file_name()
                .ok_or_else(|| StorageError::Other(format!("cannot move {id:?}")))?;
            fs::rename(&from, target.join(name)).await?;
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), StorageError> {
        for id in ids {
            if id == &self.root_id {
                return Err(StorageError::Other("refusing to delete the root".to_string()));
            }
            let path = self.resolve(id)?;
            if fs::metadata(&path).await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, StorageError> {
        Self::check_name(name)?;
        let path = self.resolve(parent_id)?.join(name);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::Other(format!(
                    "{name:?} exists and is not a folder"
                )));
            }
            Err(_) => fs::create_dir(&path).await?,
        }
        Ok(self.child_id(parent_id, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Shows/Season 1")).unwrap();
        std::fs::write(dir.path().join("Shows/Season 1/ep1.mkv"), b"abcd").unwrap();
        std::fs::write(dir.path().join("movie.mp4"), b"xy").unwrap();
        let storage = LocalStorage::new(dir.path(), "0");
        (dir, storage)
    }

    #[tokio::test]
    async fn test_list_root_and_nested() {
        let (_dir, storage) = storage();
        let root = storage.list("0", 100, None).await.unwrap();
        let names: Vec<_> = root.items.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["Shows", "movie.mp4"]);
        assert_eq!(root.items[0].kind, FileKind::Folder);

        let season = storage.list("Shows/Season 1", 100, None).await.unwrap();
        assert_eq!(season.items[0].id, "Shows/Season 1/ep1.mkv");
        assert_eq!(season.items[0].size, 4);
    }

    #[tokio::test]
    async fn test_detail_walks_to_root() {
        let (_dir, storage) = storage();
        let detail = storage.detail("Shows/Season 1").await.unwrap();
        assert_eq!(detail.name, "Season 1");
        assert_eq!(detail.parent_id.as_deref(), Some("Shows"));

        let shows = storage.detail("Shows").await.unwrap();
        assert_eq!(shows.parent_id.as_deref(), Some("0"));
        assert_eq!(storage.detail("0").await.unwrap().parent_id, None);
    }

    #[tokio::test]
    async fn test_rejects_escaping_ids() {
        let (_dir, storage) = storage();
        assert!(storage.list("../etc", 10, None).await.is_err());
        assert!(storage.create_folder("a/b", "0").await.is_err());
    }

    #[tokio::test]
    async fn test_create_move_delete() {
        let (dir, storage) = storage();
        let target = storage.create_folder("Movies", "0").await.unwrap();
        assert_eq!(storage.create_folder("Movies", "0").await.unwrap(), target);

        storage.move_files(&["movie.mp4".to_string()], &target).await.unwrap();
        assert!(dir.path().join("Movies/movie.mp4").exists());

        storage.delete(&["Shows".to_string()]).await.unwrap();
        assert!(!dir.path().join("Shows").exists());
    }
}
