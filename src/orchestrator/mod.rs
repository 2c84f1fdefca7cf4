//! Runs one backup or restore end to end across every configured backend.
//!
//! A backup dumps the database once, writes the artifact to each backend and
//! then applies retention to each backend that accepted it. Backends never
//! affect one another: a failed write skips retention on that backend only.

mod report;
#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use chrono_tz::Tz;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use report::{
    BackendOutcome, BackupRun, DeletionFailure, RetentionOutcome, RunStatus, TriggerSource,
};

use crate::backup::{DumpExecutor, executor_for};
use crate::config::{AppConfig, RestoreTarget};
use crate::errors::{AppError, Result};
use crate::restore::{place_artifact, resolve_target};
use crate::retention::{self, RetentionPolicy};
use crate::storage::{Artifact, LocalStorage, S3Storage, StorageBackend, artifact_name};

pub struct Orchestrator {
    dataset: String,
    dump: Option<Arc<dyn DumpExecutor>>,
    backends: Vec<Arc<dyn StorageBackend>>,
    policy: RetentionPolicy,
    timezone: Tz,
    work_dir: Option<PathBuf>,
    dump_timeout: Option<Duration>,
    /// Held for the whole of every run. Stores the creation time of the last
    /// artifact so two runs in the same second still get distinct names.
    run_lock: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(
        dataset: impl Into<String>,
        backends: Vec<Arc<dyn StorageBackend>>,
        policy: RetentionPolicy,
        timezone: Tz,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            dump: None,
            backends,
            policy,
            timezone,
            work_dir: None,
            dump_timeout: None,
            run_lock: Mutex::new(None),
        }
    }

    pub fn with_dump(mut self, dump: Arc<dyn DumpExecutor>) -> Self {
        self.dump = Some(dump);
        self
    }

    pub fn with_dump_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dump_timeout = timeout;
        self
    }

    pub fn with_work_dir(mut self, work_dir: Option<PathBuf>) -> Self {
        self.work_dir = work_dir;
        self
    }

    /// Builds the backends in priority order: local first, then remote.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();
        if config.storage_location.uses_local() {
            let path = config
                .storage_path
                .clone()
                .ok_or_else(|| AppError::config("Local storage selected without a storage path"))?;
            backends.push(Arc::new(LocalStorage::new(path)));
        }
        if let Some(remote) = &config.remote {
            backends.push(Arc::new(S3Storage::connect(remote).await));
        }
        if backends.is_empty() {
            return Err(AppError::config("No storage backend configured"));
        }

        let mut orchestrator = Orchestrator::new(
            config.name.clone(),
            backends,
            config.retention.clone(),
            config.timezone,
        )
        .with_work_dir(config.work_dir.clone());
        if let Some(database) = &config.database {
            orchestrator = orchestrator
                .with_dump(executor_for(database))
                .with_dump_timeout(database.dump_timeout);
        }
        Ok(orchestrator)
    }

    /// Performs one backup run. Never returns an error: every failure is
    /// recorded in the returned run.
    pub async fn run_backup(&self, trigger: TriggerSource) -> BackupRun {
        let mut last_created = self.run_lock.lock().await;
        let mut run = BackupRun::new(trigger);
        info!(run_id = %run.id, %trigger, "Starting backup of '{}'", self.dataset);

        let now = Utc::now().trunc_subsecs(0);
        let created_at = match *last_created {
            Some(last) if now <= last => last + ChronoDuration::seconds(1),
            _ => now,
        };
        let name = artifact_name(&self.dataset, created_at);
        run.artifact_name = Some(name.clone());

        let workdir = match self.scratch_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to prepare a working directory");
                run.dump_error = Some(e.to_string());
                return run.finish();
            }
        };

        let produced = match self.produce(workdir.path(), &name).await {
            Ok(path) => path,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Backup failed; no backend was touched");
                run.dump_error = Some(e.to_string());
                return run.finish();
            }
        };
        *last_created = Some(created_at);

        for backend in &self.backends {
            let outcome = self.store_and_prune(backend.as_ref(), &produced, &name).await;
            run.backends.push(outcome);
        }

        let run = run.finish();
        match run.status() {
            RunStatus::Succeeded => info!(
                run_id = %run.id,
                artifact = %name,
                deletion_failures = run.deletion_failures(),
                "Backup complete"
            ),
            status => warn!(
                run_id = %run.id,
                artifact = %name,
                ?status,
                "Backup finished with failures"
            ),
        }
        run
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dbbackup-");
        let dir = match &self.work_dir {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn produce(&self, workdir: &Path, name: &str) -> Result<PathBuf> {
        let dump = self
            .dump
            .as_ref()
            .ok_or_else(|| AppError::Dump("no database is configured".to_string()))?;
        debug!(dump = %dump.describe(), "Producing artifact {}", name);

        let produce = dump.produce_artifact(workdir, name);
        let result = match self.dump_timeout {
            Some(limit) => tokio::time::timeout(limit, produce)
                .await
                .map_err(|_| AppError::DumpTimeout(limit.as_secs()))?,
            None => produce.await,
        };
        result.map_err(|e| AppError::Dump(format!("{:#}", e)))
    }

    async fn store_and_prune(
        &self,
        backend: &dyn StorageBackend,
        produced: &Path,
        name: &str,
    ) -> BackendOutcome {
        let kind = backend.kind();
        let artifact = match backend.put_artifact(produced, &self.dataset, name).await {
            Ok(artifact) => artifact,
            Err(e) => {
                let err = AppError::storage(kind, e);
                error!(backend = %kind, artifact = %name, error = %err, "Failed to store artifact");
                return BackendOutcome::WriteFailed {
                    backend: kind,
                    reason: err.to_string(),
                };
            }
        };
        info!(backend = %kind, location = %backend.describe(), artifact = %name, "Artifact stored");

        let retention = self.apply_retention(backend, &artifact).await;
        BackendOutcome::Stored {
            backend: kind,
            artifact,
            retention,
        }
    }

    async fn apply_retention(
        &self,
        backend: &dyn StorageBackend,
        written: &Artifact,
    ) -> RetentionOutcome {
        let kind = backend.kind();
        if self.policy.is_unrestricted() {
            debug!(backend = %kind, "No retention policy configured; keeping every artifact");
            return RetentionOutcome::Disabled;
        }

        let mut listed = match backend.list_artifacts(&self.dataset).await {
            Ok(listed) => listed,
            Err(e) => {
                let err = AppError::listing(kind, e);
                warn!(backend = %kind, error = %err, "Skipping retention; nothing deleted");
                return RetentionOutcome::Skipped {
                    reason: err.to_string(),
                };
            }
        };
        if !listed.iter().any(|a| a.name == written.name) {
            listed.push(written.clone());
        }

        let decision = retention::evaluate(&listed, &self.policy, &self.timezone);
        let mut deleted = Vec::new();
        let mut failures = Vec::new();
        for artifact in &decision.delete {
            match backend.delete_artifact(artifact).await {
                Ok(()) => {
                    debug!(backend = %kind, artifact = %artifact.name, "Deleted by retention");
                    deleted.push(artifact.name.clone());
                }
                Err(e) => {
                    let err = AppError::storage(kind, e);
                    error!(
                        backend = %kind,
                        artifact = %artifact.name,
                        error = %err,
                        "Failed to delete artifact"
                    );
                    failures.push(DeletionFailure {
                        artifact: artifact.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        info!(
            backend = %kind,
            kept = decision.keep.len(),
            deleted = deleted.len(),
            failed = failures.len(),
            "Retention applied"
        );
        RetentionOutcome::Applied {
            kept: decision.keep.len(),
            deleted,
            failures,
        }
    }

    /// Resolves `target` across every backend and places the chosen artifact
    /// under `restore_path`, returning the restored directory.
    pub async fn run_restore(
        &self,
        target: &RestoreTarget,
        restore_path: &Path,
    ) -> Result<PathBuf> {
        let _guard = self.run_lock.lock().await;
        info!(target = %target, "Starting restore of '{}'", self.dataset);

        let mut candidates = Vec::new();
        for backend in &self.backends {
            match backend.list_artifacts(&self.dataset).await {
                Ok(mut listed) => {
                    listed.sort_by(|a, b| {
                        b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name))
                    });
                    candidates.extend(listed);
                }
                Err(e) => {
                    let err = AppError::listing(backend.kind(), e);
                    warn!(
                        backend = %backend.kind(),
                        error = %err,
                        "Backend unavailable for restore"
                    );
                }
            }
        }

        let chosen = resolve_target(&candidates, target)
            .ok_or_else(|| AppError::ArtifactNotFound(target.to_string()))?;
        let backend = self
            .backends
            .iter()
            .find(|b| b.kind() == chosen.backend)
            .ok_or_else(|| AppError::ArtifactNotFound(target.to_string()))?;

        place_artifact(backend.as_ref(), chosen, restore_path)
            .await
            .map_err(|e| AppError::Restore(format!("{:#}", e)))
    }
}
