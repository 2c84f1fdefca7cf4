// dbbackup/src/storage/s3.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::{Artifact, BackendKind, StorageBackend};
use crate::config::RemoteConfig;

/// Artifacts stored as objects in an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Storage {
    /// Builds a client with static credentials, mirroring how the config names them.
    pub async fn connect(remote: &RemoteConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(remote.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &remote.access_key_id,
                &remote.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ));
        if let Some(endpoint) = &remote.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut s3_config = s3::config::Builder::from(&sdk_config);
        if remote.endpoint_url.is_some() {
            // Most S3-compatible services only support path-style addressing.
            s3_config = s3_config.force_path_style(true);
        }

        tracing::info!(
            bucket = %remote.bucket_name,
            prefix = remote.bucket_path.as_deref().unwrap_or(""),
            "S3 client initialized"
        );

        Self {
            client: s3::Client::from_conf(s3_config.build()),
            bucket: remote.bucket_name.clone(),
            prefix: remote.bucket_path.clone(),
        }
    }

    fn object_key(&self, name: &str) -> String {
        object_key(self.prefix.as_deref(), name)
    }
}

fn object_key(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name.to_string(),
    }
}

fn listing_prefix(prefix: Option<&str>, dataset: &str) -> String {
    object_key(prefix, &format!("{}-", dataset))
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(""))
    }

    async fn list_artifacts(&self, dataset: &str) -> Result<Vec<Artifact>> {
        let prefix = listing_prefix(self.prefix.as_deref(), dataset);
        let mut artifacts = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| {
                    format!("Failed to list objects in s3://{}/{}", self.bucket, prefix)
                })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.rsplit('/').next().unwrap_or(key);
                if let Some(artifact) = Artifact::from_name(BackendKind::Remote, dataset, name) {
                    let size = object.size().and_then(|s| u64::try_from(s).ok());
                    artifacts.push(match size {
                        Some(size) => artifact.with_size(size),
                        None => artifact,
                    });
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(artifacts)
    }

    async fn put_artifact(&self, source: &Path, dataset: &str, name: &str) -> Result<Artifact> {
        let artifact = Artifact::from_name(BackendKind::Remote, dataset, name)
            .with_context(|| {
                format!("Refusing to store artifact with unparseable name: {}", name)
            })?;
        let key = self.object_key(name);
        let size = tokio::fs::metadata(source)
            .await
            .with_context(|| format!("Failed to stat {}", source.display()))?
            .len();
        let body = ByteStream::from_path(source)
            .await
            .with_context(|| {
                format!("Failed to create ByteStream from file: {}", source.display())
            })?;

        // PutObject is atomic: the key only becomes visible once the upload completes.
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!("Failed to upload {} to s3://{}/{}", source.display(), self.bucket, key)
            })?;

        tracing::debug!(bucket = %self.bucket, key = %key, size, "Uploaded artifact");
        Ok(artifact.with_size(size))
    }

    async fn fetch_artifact(&self, artifact: &Artifact, destination: &Path) -> Result<()> {
        let key = self.object_key(&artifact.name);
        let parent = destination
            .parent()
            .with_context(|| {
                format!("Destination has no parent directory: {}", destination.display())
            })?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| {
                format!("Failed to create directory for download: {}", parent.display())
            })?;

        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to get object s3://{}/{}", self.bucket, key))?;

        let partial = parent.join(format!(".{}.partial", artifact.name));
        let download = async {
            let mut output = File::create(&partial)
                .await
                .with_context(|| format!("Failed to create file: {}", partial.display()))?;
            let mut total_bytes = 0usize;
            while let Some(chunk) = object
                .body
                .try_next()
                .await
                .with_context(|| format!("Failed while streaming s3://{}/{}", self.bucket, key))?
            {
                output
                    .write_all(&chunk)
                    .await
                    .with_context(|| format!("Failed to write to {}", partial.display()))?;
                total_bytes += chunk.len();
            }
            output.flush().await?;
            tokio::fs::rename(&partial, destination)
                .await
                .with_context(|| {
                    format!("Failed to move download into place at {}", destination.display())
                })?;
            anyhow::Ok(total_bytes)
        };

        match download.await {
            Ok(total_bytes) => {
                tracing::debug!(key = %key, bytes = total_bytes, "Downloaded artifact");
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn delete_artifact(&self, artifact: &Artifact) -> Result<()> {
        let key = self.object_key(&artifact.name);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", self.bucket, key))?;
        Ok(())
    }
}
