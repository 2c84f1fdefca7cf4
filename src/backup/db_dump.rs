// dbbackup/src/backup/db_dump.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use url::Url;

use super::archive::create_tar_gz_archive;
use crate::config::{DatabaseConfig, DbEngine};
use crate::utils::{find_executable, redact_uri};

/// Produces one compressed artifact from the live database.
#[async_trait]
pub trait DumpExecutor: Send + Sync {
    fn describe(&self) -> String;

    /// Dumps into scratch space under `workdir` and packs the result into
    /// `workdir/<artifact_name>`, returning that path.
    async fn produce_artifact(&self, workdir: &Path, artifact_name: &str) -> Result<PathBuf>;
}

pub fn executor_for(database: &DatabaseConfig) -> Arc<dyn DumpExecutor> {
    match database.engine {
        DbEngine::MongoDb => Arc::new(MongoDump {
            uri: database.uri.clone(),
            db_name: database.db_name.clone(),
        }),
        DbEngine::Postgres => Arc::new(PgDump {
            uri: database.uri.clone(),
            db_name: database.db_name.clone(),
        }),
    }
}

/// Runs a client tool to completion. The child is killed if the future is
/// dropped, so a timed-out dump does not linger.
async fn run_tool(command: &mut Command, tool: &str) -> Result<()> {
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", tool))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "{} failed with status: {}\nStdout: {}\nStderr: {}",
            tool,
            output.status,
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

async fn archive_in_background(source: PathBuf, archive: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || create_tar_gz_archive(&source, &archive))
        .await
        .context("Archive task panicked")?
}

pub struct MongoDump {
    uri: String,
    db_name: String,
}

#[async_trait]
impl DumpExecutor for MongoDump {
    fn describe(&self) -> String {
        format!("mongodump of '{}' on {}", self.db_name, redact_uri(&self.uri))
    }

    async fn produce_artifact(&self, workdir: &Path, artifact_name: &str) -> Result<PathBuf> {
        let mongodump = find_executable("mongodump")?;
        let dump_dir = workdir.join("dump");
        tokio::fs::create_dir_all(&dump_dir)
            .await
            .with_context(|| format!("Failed to create dump directory: {}", dump_dir.display()))?;

        tracing::debug!(db = %self.db_name, out = %dump_dir.display(), "Running mongodump");
        run_tool(
            Command::new(mongodump)
                .arg("--uri")
                .arg(&self.uri)
                .arg("--db")
                .arg(&self.db_name)
                .arg(format!("--out={}", dump_dir.display())),
            "mongodump",
        )
        .await?;

        // mongodump writes one sub-directory per database.
        let source = dump_dir.join(&self.db_name);
        archive_in_background(source, workdir.join(artifact_name)).await
    }
}

pub struct PgDump {
    uri: String,
    db_name: String,
}

impl PgDump {
    /// The server URI with its path replaced by the configured database.
    fn database_url(&self) -> Result<String> {
        database_url(&self.uri, &self.db_name)
    }
}

fn database_url(uri: &str, db_name: &str) -> Result<String> {
    let mut parsed = Url::parse(uri)
        .with_context(|| format!("Invalid database URL format: {}", redact_uri(uri)))?;
    parsed.set_path(&format!("/{}", db_name));
    Ok(parsed.to_string())
}

#[async_trait]
impl DumpExecutor for PgDump {
    fn describe(&self) -> String {
        format!("pg_dump of '{}' on {}", self.db_name, redact_uri(&self.uri))
    }

    async fn produce_artifact(&self, workdir: &Path, artifact_name: &str) -> Result<PathBuf> {
        let pg_dump = find_executable("pg_dump")?;
        let db_url = self.database_url()?;

        // Fail fast with a driver error instead of pg_dump's less specific one.
        let conn = PgConnection::connect(&db_url)
            .await
            .with_context(|| format!("Failed to connect to {}", redact_uri(&db_url)))?;
        conn.close().await.ok();

        let dump_dir = workdir.join("dump");
        tokio::fs::create_dir_all(&dump_dir)
            .await
            .with_context(|| format!("Failed to create dump directory: {}", dump_dir.display()))?;
        let dump_file = dump_dir.join(format!("{}.sql", self.db_name));

        tracing::debug!(db = %self.db_name, out = %dump_file.display(), "Running pg_dump");
        run_tool(
            Command::new(pg_dump)
                .arg("--format=plain")
                .arg("--no-owner")
                .arg("--file")
                .arg(&dump_file)
                .arg(&db_url),
            "pg_dump",
        )
        .await?;

        archive_in_background(dump_dir, workdir.join(artifact_name)).await
    }
}
