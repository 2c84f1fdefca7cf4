// dbbackup/src/orchestrator/report.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::storage::{Artifact, BackendKind};

/// What caused a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    OnDemand,
    /// A single run on process start with no scheduler.
    OneShot,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Scheduled => write!(f, "scheduled"),
            TriggerSource::OnDemand => write!(f, "on-demand"),
            TriggerSource::OneShot => write!(f, "one-shot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionFailure {
    pub artifact: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RetentionOutcome {
    /// No tier and no maximum configured; nothing was listed or deleted.
    Disabled,
    /// The backend could not be listed, so nothing was deleted.
    Skipped { reason: String },
    Applied {
        kept: usize,
        deleted: Vec<String>,
        failures: Vec<DeletionFailure>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BackendOutcome {
    Stored {
        backend: BackendKind,
        artifact: Artifact,
        retention: RetentionOutcome,
    },
    WriteFailed {
        backend: BackendKind,
        reason: String,
    },
}

impl BackendOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, BackendOutcome::Stored { .. })
    }
}

/// The record of one backup run from trigger to completion.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    pub id: Uuid,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact_name: Option<String>,
    pub dump_error: Option<String>,
    pub backends: Vec<BackendOutcome>,
}

impl BackupRun {
    pub fn new(trigger: TriggerSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            artifact_name: None,
            dump_error: None,
            backends: Vec::new(),
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    /// Failed when nothing was stored anywhere, partially failed when at least
    /// one backend rejected the write.
    pub fn status(&self) -> RunStatus {
        let stored = self.backends.iter().filter(|b| b.is_stored()).count();
        if self.dump_error.is_some() || stored == 0 {
            RunStatus::Failed
        } else if stored < self.backends.len() {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn deletion_failures(&self) -> usize {
        self.backends
            .iter()
            .map(|outcome| match outcome {
                BackendOutcome::Stored {
                    retention: RetentionOutcome::Applied { failures, .. },
                    ..
                } => failures.len(),
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(backend: BackendKind) -> BackendOutcome {
        BackendOutcome::Stored {
            backend,
            artifact: Artifact::from_name(backend, "orders", "orders-20250101T000000Z.tgz")
                .unwrap(),
            retention: RetentionOutcome::Disabled,
        }
    }

    fn failed(backend: BackendKind) -> BackendOutcome {
        BackendOutcome::WriteFailed {
            backend,
            reason: "disk full".to_string(),
        }
    }

    #[test]
    fn test_status_from_outcomes() {
        let mut run = BackupRun::new(TriggerSource::OnDemand);
        assert_eq!(run.status(), RunStatus::Failed);

        run.backends = vec![stored(BackendKind::Local), stored(BackendKind::Remote)];
        assert_eq!(run.status(), RunStatus::Succeeded);

        run.backends = vec![failed(BackendKind::Local), stored(BackendKind::Remote)];
        assert_eq!(run.status(), RunStatus::PartiallyFailed);

        run.backends = vec![failed(BackendKind::Local), failed(BackendKind::Remote)];
        assert_eq!(run.status(), RunStatus::Failed);

        run.backends = vec![stored(BackendKind::Local)];
        run.dump_error = Some("boom".to_string());
        assert_eq!(run.status(), RunStatus::Failed);
    }

    #[test]
    fn test_run_serializes_with_tagged_outcomes() -> anyhow::Result<()> {
        let mut run = BackupRun::new(TriggerSource::Scheduled);
        run.backends = vec![failed(BackendKind::Remote)];
        let json = serde_json::to_value(run.finish())?;
        assert_eq!(json["trigger"], "scheduled");
        assert_eq!(json["backends"][0]["result"], "write_failed");
        assert_eq!(json["backends"][0]["backend"], "remote");
        assert!(json["finished_at"].is_string());
        Ok(())
    }
}
