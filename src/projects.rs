//! Project-file store backing the SD-card endpoints of the dashboard.
//!
//! Projects are plain G-code files inside a single directory. The store
//! keeps a cached listing plus the current selection; the job runner
//! resolves the selected project to a path through [`ProjectStore::selected_path`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProjectStoreError {
    #[error("project storage is not initialized")]
    NotInitialized,
    #[error("project '{0}' not found")]
    NotFound(String),
    #[error("invalid project name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct ProjectStore {
    root: PathBuf,
    files: Vec<String>,
    selected: Option<String>,
    initialized: bool,
}

fn validate_name(name: &str) -> Result<(), ProjectStoreError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(ProjectStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProjectStore {
            root: root.into(),
            files: Vec::new(),
            selected: None,
            initialized: false,
        }
    }

    pub async fn init(&mut self) -> Result<(), ProjectStoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        self.initialized = true;
        self.refresh().await?;
        info!(
            "Project storage initialized at {:?} ({} files)",
            self.root,
            self.files.len()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Rescans the projects directory. The selection survives a rescan as
    /// long as the file still exists.
    pub async fn refresh(&mut self) -> Result<(), ProjectStoreError> {
        if !self.initialized {
            return Err(ProjectStoreError::NotInitialized);
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        self.files = files;

        if let Some(selected) = &self.selected {
            if !self.files.iter().any(|f| f == selected) {
                warn!("Selected project '{}' disappeared from storage", selected);
                self.selected = None;
            }
        }

        Ok(())
    }

    pub fn list(&self) -> &[String] {
        &self.files
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected_path(&self) -> Option<PathBuf> {
        self.selected.as_ref().map(|name| self.root.join(name))
    }

    pub fn select(&mut self, name: &str) -> Result<(), ProjectStoreError> {
        if !self.initialized {
            return Err(ProjectStoreError::NotInitialized);
        }
        validate_name(name)?;
        if !self.files.iter().any(|f| f == name) {
            return Err(ProjectStoreError::NotFound(name.to_string()));
        }
        self.selected = Some(name.to_string());
        info!("Selected project '{}'", name);
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub async fn delete(&mut self, name: &str) -> Result<(), ProjectStoreError> {
        if !self.initialized {
            return Err(ProjectStoreError::NotInitialized);
        }
        validate_name(name)?;
        if !self.files.iter().any(|f| f == name) {
            return Err(ProjectStoreError::NotFound(name.to_string()));
        }

        tokio::fs::remove_file(self.root.join(name)).await?;
        self.files.retain(|f| f != name);
        if self.selected.as_deref() == Some(name) {
            self.selected = None;
        }
        info!("Deleted project '{}'", name);
        Ok(())
    }

    pub async fn read(&self, name: &str) -> Result<String, ProjectStoreError> {
        if !self.initialized {
            return Err(ProjectStoreError::NotInitialized);
        }
        validate_name(name)?;
        if !self.files.iter().any(|f| f == name) {
            return Err(ProjectStoreError::NotFound(name.to_string()));
        }
        Ok(tokio::fs::read_to_string(self.root.join(name)).await?)
    }

    /// Writes one uploaded chunk, creating the file on the first chunk.
    pub async fn write_chunk(
        &mut self,
        name: &str,
        data: &[u8],
        first: bool,
    ) -> Result<(), ProjectStoreError> {
        if !self.initialized {
            return Err(ProjectStoreError::NotInitialized);
        }
        validate_name(name)?;

        let path = self.root.join(name);
        let mut file = if first {
            tokio::fs::File::create(&path).await?
        } else {
            tokio::fs::OpenOptions::new().append(true).open(&path).await?
        };
        file.write_all(data).await?;
        file.flush().await?;

        if first && !self.files.iter().any(|f| f == name) {
            self.files.push(name.to_string());
            self.files.sort();
        }
        Ok(())
    }

    /// Remounts the storage: recreates the directory and rescans.
    pub async fn reinitialize(&mut self) -> Result<(), ProjectStoreError> {
        self.initialized = false;
        self.files.clear();
        self.init().await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in_temp(tag: &str) -> ProjectStore {
        let dir = std::env::temp_dir().join(format!(
            "hotwire-projects-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let mut store = ProjectStore::new(dir);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn select_requires_existing_file() {
        let mut store = store_in_temp("select").await;
        assert!(matches!(
            store.select("missing.gcode"),
            Err(ProjectStoreError::NotFound(_))
        ));

        store
            .write_chunk("part.gcode", b"G0 X1 Y1\n", true)
            .await
            .unwrap();
        store.select("part.gcode").unwrap();
        assert_eq!(store.selected(), Some("part.gcode"));
    }

    #[tokio::test]
    async fn delete_clears_the_selection() {
        let mut store = store_in_temp("delete").await;
        store.write_chunk("a.gcode", b"G1 X2\n", true).await.unwrap();
        store.select("a.gcode").unwrap();

        store.delete("a.gcode").await.unwrap();
        assert_eq!(store.selected(), None);
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let mut store = store_in_temp("names").await;
        for name in ["../evil", "a/b", "", ".hidden"] {
            assert!(matches!(
                store.write_chunk(name, b"x", true).await,
                Err(ProjectStoreError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn refresh_picks_up_external_files() {
        let mut store = store_in_temp("refresh").await;
        tokio::fs::write(store.root().join("ext.gcode"), "G0 X0\n")
            .await
            .unwrap();
        store.refresh().await.unwrap();
        assert_eq!(store.list(), &["ext.gcode".to_string()]);
    }
}
