//! Storage backends holding backup artifacts.
//!
//! A backend's listing is the only source of truth for which artifacts exist;
//! artifact names encode the dataset and the UTC creation time so retention can
//! be recomputed from a listing alone.

pub(crate) mod local;
pub(crate) mod s3;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;

pub use local::LocalStorage;
pub use s3::S3Storage;

pub const ARTIFACT_EXTENSION: &str = ".tgz";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

/// One persisted backup instance on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub backend: BackendKind,
    pub dataset: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: Option<u64>,
}

impl Artifact {
    /// Parses a stored file or object name. Returns `None` for anything that is
    /// not an artifact of `dataset`.
    pub fn from_name(backend: BackendKind, dataset: &str, name: &str) -> Option<Self> {
        let created_at = parse_artifact_timestamp(dataset, name)?;
        Some(Artifact {
            backend,
            dataset: dataset.to_string(),
            name: name.to_string(),
            created_at,
            size: None,
        })
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// The artifact name without its archive extension.
    pub fn stem(&self) -> &str {
        self.name
            .strip_suffix(ARTIFACT_EXTENSION)
            .unwrap_or(&self.name)
    }
}

/// Builds the deterministic artifact name for a dataset and creation time.
pub fn artifact_name(dataset: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}{}",
        dataset,
        created_at.format(TIMESTAMP_FORMAT),
        ARTIFACT_EXTENSION
    )
}

pub fn parse_artifact_timestamp(dataset: &str, name: &str) -> Option<DateTime<Utc>> {
    let stamp = name
        .strip_prefix(dataset)?
        .strip_prefix('-')?
        .strip_suffix(ARTIFACT_EXTENSION)?;
    parse_timestamp(stamp)
}

/// Parses the `YYYYMMDDTHHMMSSZ` form used in artifact names.
pub fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Capability set every backend provides to the orchestrator.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Human readable location used in log lines.
    fn describe(&self) -> String;

    async fn list_artifacts(&self, dataset: &str) -> Result<Vec<Artifact>>;

    /// Stores the file at `source` under `name`. The artifact must never be
    /// visible in a listing until it is completely written.
    async fn put_artifact(&self, source: &Path, dataset: &str, name: &str) -> Result<Artifact>;

    /// Copies the artifact content to `destination`.
    async fn fetch_artifact(&self, artifact: &Artifact, destination: &Path) -> Result<()>;

    async fn delete_artifact(&self, artifact: &Artifact) -> Result<()>;
}
