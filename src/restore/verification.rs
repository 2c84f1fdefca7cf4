// dbbackup/src/restore/verification.rs
use anyhow::Result;
use std::path::Path;

use crate::backup::archive::inspect_tar_gz_archive;

/// Reads the fetched archive end to end before anything is extracted, so a
/// truncated or corrupt download never reaches the restore path.
pub fn verify_archive(archive_path: &Path) -> Result<usize> {
    let entries = inspect_tar_gz_archive(archive_path)?;
    if entries == 0 {
        return Err(anyhow::anyhow!(
            "Archive {} contains no entries",
            archive_path.display()
        ));
    }
    tracing::debug!(archive = %archive_path.display(), entries, "Archive verified");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::create_tar_gz_archive;

    #[test]
    fn test_empty_archive_is_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let empty_dir = tmp.path().join("empty");
        std::fs::create_dir_all(&empty_dir)?;
        let archive = tmp.path().join("empty.tgz");
        create_tar_gz_archive(&empty_dir, &archive)?;

        let err = verify_archive(&archive).unwrap_err();
        assert!(err.to_string().contains("contains no entries"));
        Ok(())
    }

    #[test]
    fn test_populated_archive_passes() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("dump");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("orders.bson"), b"data")?;
        let archive = tmp.path().join("dump.tgz");
        create_tar_gz_archive(&dir, &archive)?;

        assert_eq!(verify_archive(&archive)?, 1);
        Ok(())
    }
}
