// dbbackup/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use walkdir::WalkDir;

/// Creates a GZipped TAR archive from a source directory.
///
/// The paths inside the archive are relative to `source_dir`. The archive is
/// written to a sibling `.partial` file and renamed to `archive_dest_path` only
/// once the gzip stream is finished.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }
    let parent = archive_dest_path
        .parent()
        .with_context(|| format!("Archive path has no parent: {}", archive_dest_path.display()))?;
    std::fs::create_dir_all(parent).with_context(|| {
        format!("Failed to create parent directory for archive: {}", parent.display())
    })?;

    tracing::debug!(
        source = %source_dir.display(),
        archive = %archive_dest_path.display(),
        "Creating tar.gz archive"
    );

    let partial_path = archive_dest_path.with_extension("partial");
    let result = write_archive(source_dir, &partial_path).and_then(|_| {
        std::fs::rename(&partial_path, archive_dest_path).with_context(|| {
            format!("Failed to move archive into place: {}", archive_dest_path.display())
        })
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&partial_path);
    }
    result?;

    Ok(archive_dest_path.to_path_buf())
}

fn write_archive(source_dir: &Path, archive_path: &Path) -> Result<()> {
    let archive_file = File::create(archive_path)
        .with_context(|| format!("Failed to create archive file: {}", archive_path.display()))?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.with_context(|| {
            format!("Failed to walk directory: {}", source_dir.display())
        })?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source_dir.display(),
                path.display()
            )
        })?;

        if name.as_os_str().is_empty() {
            continue;
        }

        // Directories are appended on their own; WalkDir visits their children next.
        if entry.file_type().is_dir() {
            tar_builder
                .append_dir(name, path)
                .with_context(|| {
                    format!("Failed to append directory {} to archive", path.display())
                })?;
        } else if entry.file_type().is_file() {
            tar_builder.append_path_with_name(path, name).with_context(|| {
                format!("Failed to append file {} as {} to archive", path.display(), name.display())
            })?;
        }
    }

    let encoder = tar_builder
        .into_inner()
        .with_context(|| {
            format!("Failed to finish tar stream for archive: {}", archive_path.display())
        })?;
    let file = encoder
        .finish()
        .with_context(|| {
            format!("Failed to finish Gzip encoding for archive: {}", archive_path.display())
        })?;
    file.sync_all()
        .with_context(|| format!("Failed to flush archive to disk: {}", archive_path.display()))?;
    Ok(())
}

/// Extracts a GZipped TAR archive into `extract_to_dir`, creating it if needed.
pub fn extract_tar_gz_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    if !archive_path.is_file() {
        return Err(anyhow::anyhow!(
            "Archive for extraction is not a file: {}",
            archive_path.display()
        ));
    }

    if !extract_to_dir.exists() {
        std::fs::create_dir_all(extract_to_dir).with_context(|| {
            format!("Failed to create extraction directory: {}", extract_to_dir.display())
        })?;
    } else if !extract_to_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Extraction path exists but is not a directory: {}",
            extract_to_dir.display()
        ));
    }

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let gz_decoder = flate2::read::GzDecoder::new(archive_file);
    let mut archive = tar::Archive::new(gz_decoder);

    // `unpack` refuses entries that would escape the destination directory.
    archive.unpack(extract_to_dir).with_context(|| {
        format!(
            "Failed to unpack archive {} to {}",
            archive_path.display(),
            extract_to_dir.display()
        )
    })?;

    Ok(extract_to_dir.to_path_buf())
}

/// Reads every entry of the archive without writing anything, returning the
/// number of entries. Fails on truncated or corrupt archives.
pub fn inspect_tar_gz_archive(archive_path: &Path) -> Result<usize> {
    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(archive_file));
    let mut count = 0;
    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read entries of {}", archive_path.display()))?
    {
        let mut entry = entry.with_context(|| {
            format!("Corrupt entry in {}", archive_path.display())
        })?;
        std::io::copy(&mut entry, &mut std::io::sink())
            .with_context(|| format!("Truncated entry in {}", archive_path.display()))?;
        count += 1;
    }
    Ok(count)
}
