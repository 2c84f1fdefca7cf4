// dbbackup/src/storage/local.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{Artifact, BackendKind, StorageBackend};

/// Artifacts stored as plain files in one directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn partial_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!(".{}.partial", name))
    }
}

/// Copies `source` next to `destination` under a hidden name, then renames it
/// into place so readers never observe a truncated file.
pub(crate) async fn copy_atomically(source: &Path, destination: &Path) -> Result<u64> {
    let parent = destination
        .parent()
        .with_context(|| {
            format!("Destination has no parent directory: {}", destination.display())
        })?;
    let file_name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Destination has no file name: {}", destination.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let partial = LocalStorage::partial_path(parent, file_name);
    let copied = match fs::copy(source, &partial).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&partial).await;
            return Err(e).with_context(|| {
                format!("Failed to copy {} to {}", source.display(), partial.display())
            });
        }
    };
    if let Err(e) = fs::rename(&partial, destination).await {
        let _ = fs::remove_file(&partial).await;
        return Err(e).with_context(|| {
            format!("Failed to move {} into place at {}", partial.display(), destination.display())
        });
    }
    Ok(copied)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn list_artifacts(&self, dataset: &str) -> Result<Vec<Artifact>> {
        let exists = fs::try_exists(&self.root)
            .await
            .with_context(|| {
                format!("Failed to access storage directory: {}", self.root.display())
            })?;
        if !exists {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read storage directory: {}", self.root.display()))?;
        let mut artifacts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to read entry in {}", self.root.display()))?
        {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(artifact) = Artifact::from_name(BackendKind::Local, dataset, name) {
                artifacts.push(artifact.with_size(metadata.len()));
            }
        }
        Ok(artifacts)
    }

    async fn put_artifact(&self, source: &Path, dataset: &str, name: &str) -> Result<Artifact> {
        let artifact = Artifact::from_name(BackendKind::Local, dataset, name)
            .with_context(|| {
                format!("Refusing to store artifact with unparseable name: {}", name)
            })?;
        let destination = self.root.join(name);
        let size = copy_atomically(source, &destination).await?;
        tracing::debug!(path = %destination.display(), size, "Stored artifact");
        Ok(artifact.with_size(size))
    }

    async fn fetch_artifact(&self, artifact: &Artifact, destination: &Path) -> Result<()> {
        let source = self.root.join(&artifact.name);
        copy_atomically(&source, destination).await?;
        Ok(())
    }

    async fn delete_artifact(&self, artifact: &Artifact) -> Result<()> {
        let path = self.root.join(&artifact.name);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to delete {}", path.display()))
    }
}
