// dbbackup/src/restore/logic.rs
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::verification::verify_archive;
use crate::backup::archive::extract_tar_gz_archive;
use crate::config::RestoreTarget;
use crate::storage::{Artifact, StorageBackend, parse_timestamp};

/// Picks the artifact a restore target refers to.
///
/// `candidates` must be in backend priority order. `Latest` takes the newest
/// artifact, preferring the earlier backend when two hold the same one. A named
/// target matches the full artifact name, its stem, or its timestamp.
pub fn resolve_target<'a>(
    candidates: &'a [Artifact],
    target: &RestoreTarget,
) -> Option<&'a Artifact> {
    match target {
        RestoreTarget::Latest => {
            let mut newest: Option<&Artifact> = None;
            for candidate in candidates {
                let newer = newest.is_none_or(|current| {
                    (candidate.created_at, &candidate.name) > (current.created_at, &current.name)
                });
                if newer {
                    newest = Some(candidate);
                }
            }
            newest
        }
        RestoreTarget::Named(wanted) => {
            let wanted = wanted.trim();
            let stamp = parse_timestamp(wanted);
            candidates.iter().find(|candidate| {
                candidate.name == wanted
                    || candidate.stem() == wanted
                    || stamp.is_some_and(|at| at == candidate.created_at)
            })
        }
    }
}

/// Fetches `artifact` from `backend`, verifies it and extracts it to
/// `<restore_path>/<artifact stem>`.
///
/// Everything happens inside a hidden staging directory under `restore_path`
/// that is removed on every exit path; the final directory only appears
/// through a rename once extraction has succeeded.
pub async fn place_artifact(
    backend: &dyn StorageBackend,
    artifact: &Artifact,
    restore_path: &Path,
) -> Result<PathBuf> {
    let final_dir = restore_path.join(artifact.stem());
    let exists = tokio::fs::try_exists(&final_dir)
        .await
        .with_context(|| format!("Failed to access restore destination: {}", final_dir.display()))?;
    if exists {
        return Err(anyhow::anyhow!(
            "Restore destination already exists: {}",
            final_dir.display()
        ));
    }

    tokio::fs::create_dir_all(restore_path)
        .await
        .with_context(|| format!("Failed to create restore path: {}", restore_path.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".restore-")
        .tempdir_in(restore_path)
        .with_context(|| {
            format!("Failed to create staging directory in {}", restore_path.display())
        })?;

    let archive_path = staging.path().join(&artifact.name);
    tracing::info!(
        artifact = %artifact.name,
        backend = %artifact.backend,
        "Fetching artifact for restore"
    );
    backend
        .fetch_artifact(artifact, &archive_path)
        .await
        .with_context(|| format!("Failed to fetch {} from {}", artifact.name, backend.describe()))?;

    let content_dir = staging.path().join("content");
    let (archive, content) = (archive_path.clone(), content_dir.clone());
    let entries = tokio::task::spawn_blocking(move || -> Result<usize> {
        let entries = verify_archive(&archive)?;
        extract_tar_gz_archive(&archive, &content)?;
        Ok(entries)
    })
    .await
    .context("Extraction task panicked")??;

    tokio::fs::rename(&content_dir, &final_dir).await.with_context(|| {
        format!("Failed to move restored content into place at {}", final_dir.display())
    })?;

    tracing::info!(
        artifact = %artifact.name,
        entries,
        destination = %final_dir.display(),
        "Artifact restored"
    );
    Ok(final_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::create_tar_gz_archive;
    use crate::storage::{BackendKind, LocalStorage, artifact_name};
    use chrono::{TimeZone, Utc};

    fn artifact(backend: BackendKind, day: u32) -> Artifact {
        let at = Utc.with_ymd_and_hms(2025, 3, day, 2, 0, 0).unwrap();
        Artifact::from_name(backend, "orders", &artifact_name("orders", at)).unwrap()
    }

    #[test]
    fn test_latest_prefers_newest_then_first_backend() {
        let candidates = vec![
            artifact(BackendKind::Local, 3),
            artifact(BackendKind::Local, 5),
            artifact(BackendKind::Remote, 5),
            artifact(BackendKind::Remote, 4),
        ];
        let chosen = resolve_target(&candidates, &RestoreTarget::Latest).unwrap();
        assert_eq!(chosen.name, "orders-20250305T020000Z.tgz");
        assert_eq!(chosen.backend, BackendKind::Local);
        assert!(resolve_target(&[], &RestoreTarget::Latest).is_none());
    }

    #[test]
    fn test_named_target_forms() {
        let candidates = vec![artifact(BackendKind::Remote, 3), artifact(BackendKind::Remote, 4)];
        for wanted in [
            "orders-20250304T020000Z.tgz",
            "orders-20250304T020000Z",
            "20250304T020000Z",
        ] {
            let chosen =
                resolve_target(&candidates, &RestoreTarget::Named(wanted.to_string())).unwrap();
            assert_eq!(chosen.name, "orders-20250304T020000Z.tgz", "target {}", wanted);
        }
        let unknown = RestoreTarget::Named("20250101T000000Z".to_string());
        assert!(resolve_target(&candidates, &unknown).is_none());
    }

    #[tokio::test]
    async fn test_place_artifact_extracts_into_stem_directory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("dump");
        std::fs::create_dir_all(&source)?;
        std::fs::write(source.join("orders.bson"), b"rows")?;

        let storage = LocalStorage::new(tmp.path().join("store"));
        let name = artifact_name("orders", Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap());
        let packed = tmp.path().join(&name);
        create_tar_gz_archive(&source, &packed)?;
        let stored = storage.put_artifact(&packed, "orders", &name).await?;

        let restore_root = tmp.path().join("restore");
        let placed = place_artifact(&storage, &stored, &restore_root).await?;
        assert_eq!(placed, restore_root.join("orders-20250304T020000Z"));
        assert_eq!(std::fs::read(placed.join("orders.bson"))?, b"rows");

        // Only the final directory remains; staging is gone.
        let entries: Vec<_> = std::fs::read_dir(&restore_root)?.collect::<std::io::Result<_>>()?;
        assert_eq!(entries.len(), 1);

        let err = place_artifact(&storage, &stored, &restore_root).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_artifact_leaves_no_partial_restore() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let storage = LocalStorage::new(tmp.path().join("store"));
        let name = artifact_name("orders", Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap());
        let bogus = tmp.path().join("bogus");
        std::fs::write(&bogus, b"not an archive")?;
        let stored = storage.put_artifact(&bogus, "orders", &name).await?;

        let restore_root = tmp.path().join("restore");
        assert!(place_artifact(&storage, &stored, &restore_root).await.is_err());
        assert_eq!(std::fs::read_dir(&restore_root)?.count(), 0);
        Ok(())
    }
}
