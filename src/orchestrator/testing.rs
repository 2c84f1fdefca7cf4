// dbbackup/src/orchestrator/testing.rs
//! In-memory backends and dump producers for exercising runs without a
//! database or object store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backup::DumpExecutor;
use crate::backup::archive::create_tar_gz_archive;
use crate::storage::{Artifact, BackendKind, StorageBackend, artifact_name};

#[derive(Default)]
pub struct MemoryStorage {
    pub kind: Option<BackendKind>,
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub fail_put: bool,
    pub fail_list: bool,
    pub fail_delete: HashSet<String>,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Seeds an artifact of `dataset` created at `at` with placeholder content.
    pub fn seed(&self, dataset: &str, at: DateTime<Utc>) -> String {
        let name = artifact_name(dataset, at);
        self.objects.lock().unwrap().insert(name.clone(), b"seed".to_vec());
        name
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn kind(&self) -> BackendKind {
        self.kind.unwrap_or(BackendKind::Local)
    }

    fn describe(&self) -> String {
        format!("memory ({})", self.kind())
    }

    async fn list_artifacts(&self, dataset: &str) -> Result<Vec<Artifact>> {
        if self.fail_list {
            anyhow::bail!("listing unavailable");
        }
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter_map(|(name, body)| {
                Artifact::from_name(self.kind(), dataset, name)
                    .map(|a| a.with_size(body.len() as u64))
            })
            .collect())
    }

    async fn put_artifact(&self, source: &Path, dataset: &str, name: &str) -> Result<Artifact> {
        if self.fail_put {
            anyhow::bail!("write rejected");
        }
        let body = tokio::fs::read(source).await?;
        let size = body.len() as u64;
        self.objects.lock().unwrap().insert(name.to_string(), body);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Artifact::from_name(self.kind(), dataset, name)
            .map(|a| a.with_size(size))
            .ok_or_else(|| anyhow::anyhow!("not an artifact name: {}", name))
    }

    async fn fetch_artifact(&self, artifact: &Artifact, destination: &Path) -> Result<()> {
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(&artifact.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such object: {}", artifact.name))?;
        tokio::fs::write(destination, body).await?;
        Ok(())
    }

    async fn delete_artifact(&self, artifact: &Artifact) -> Result<()> {
        if self.fail_delete.contains(&artifact.name) {
            anyhow::bail!("delete refused");
        }
        self.objects.lock().unwrap().remove(&artifact.name);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes a small real archive, optionally after a delay or not at all.
#[derive(Default)]
pub struct FakeDump {
    pub fail: bool,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

#[async_trait]
impl DumpExecutor for FakeDump {
    fn describe(&self) -> String {
        "fake dump".to_string()
    }

    async fn produce_artifact(&self, workdir: &Path, artifact_name: &str) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        let result = if self.fail {
            Err(anyhow::anyhow!("database unreachable"))
        } else {
            let dump_dir = workdir.join("dump");
            std::fs::create_dir_all(&dump_dir)
                .and_then(|_| std::fs::write(dump_dir.join("orders.bson"), b"rows"))
                .map_err(anyhow::Error::from)
                .and_then(|_| create_tar_gz_archive(&dump_dir, &workdir.join(artifact_name)))
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
