use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, anyhow};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::{DistributedCache, DistributedEntryOptions};

/// The sidecar stored next to every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PayloadMetadata {
    /// The full cache key, the path is only derived from its hash.
    key: String,
    expires_at: Option<SystemTime>,
}

impl PayloadMetadata {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// A [`DistributedCache`] storing payloads as files in a directory.
///
/// Keys are hashed into a fanned-out directory structure. Every payload has a `.meta` sidecar
/// holding its expiration, and both files are written atomically by persisting a temporary
/// file. Pointing multiple processes at the same directory (e.g. on a network filesystem)
/// makes this a shared cache.
#[derive(Debug, Clone)]
pub struct FilesystemDistributedCache {
    root: PathBuf,
}

impl FilesystemDistributedCache {
    /// Opens the cache in `root`, creating the directory if needed.
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root).with_context(|| {
            format!(
                "failed to create distributed cache directory {}",
                root.display()
            )
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of the payload stored for `key`, laid out as `aa/bbccdd/eeff...`.
    fn payload_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
        self.root.join(&hex[..2]).join(&hex[2..8]).join(&hex[8..])
    }

    fn metadata_path(payload_path: &Path) -> PathBuf {
        payload_path.with_extension("meta")
    }

    async fn read_metadata(path: &Path) -> anyhow::Result<Option<PayloadMetadata>> {
        let contents = match fs::read(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("failed to read payload metadata"),
        };
        match serde_json::from_slice(&contents) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) => {
                // A torn or foreign file, which the next write will replace.
                tracing::debug!(path = %path.display(), error = %err, "invalid payload metadata");
                Ok(None)
            }
        }
    }

    /// Writes `contents` to `path` by persisting a temporary file.
    async fn write_atomically(&self, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
        let parent_dir = path
            .parent()
            .ok_or_else(|| anyhow!("distributed cache directory not found"))?;
        fs::create_dir_all(parent_dir)
            .await
            .context("failed to create parent directories")?;

        let temp_dir = self.root.join(".tmp");
        fs::create_dir_all(&temp_dir)
            .await
            .context("failed to create tempdir")?;
        let temp_file = NamedTempFile::new_in(&temp_dir).context("failed to create tempfile")?;
        let dup_file = temp_file.reopen().context("failed to dup filedescriptor")?;
        let mut dest = File::from_std(dup_file);

        dest.write_all(contents)
            .await
            .context("failed to write data into file")?;
        dest.flush().await.context("failed to flush file")?;

        temp_file
            .persist(path)
            .context("failed to save file in distributed cache")?;
        Ok(())
    }

    async fn remove_file(path: &Path) -> anyhow::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("failed to remove file from distributed cache"),
        }
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let payload_path = self.payload_path(key);
        let metadata_path = Self::metadata_path(&payload_path);

        let Some(metadata) = Self::read_metadata(&metadata_path).await? else {
            return Ok(None);
        };
        if metadata.key != key {
            tracing::debug!(key, "hash collision in distributed cache");
            return Ok(None);
        }
        if metadata.is_expired(SystemTime::now()) {
            tracing::trace!(key, "removing expired payload");
            self.delete(key).await?;
            return Ok(None);
        }

        match fs::read(&payload_path).await {
            Ok(payload) => Ok(Some(payload)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("failed to read payload"),
        }
    }

    async fn store(
        &self,
        key: &str,
        payload: &[u8],
        options: DistributedEntryOptions,
    ) -> anyhow::Result<()> {
        let payload_path = self.payload_path(key);
        let metadata = PayloadMetadata {
            key: key.to_owned(),
            expires_at: options
                .absolute_expiration_relative_to_now
                .and_then(|expiration| SystemTime::now().checked_add(expiration)),
        };
        let metadata = serde_json::to_vec(&metadata).context("failed to serialize metadata")?;

        self.write_atomically(&payload_path, payload).await?;
        self.write_atomically(&Self::metadata_path(&payload_path), &metadata)
            .await?;

        tracing::trace!(key, bytes = payload.len(), "stored payload");
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let payload_path = self.payload_path(key);
        // Without its metadata a payload is unreachable, so that goes first.
        Self::remove_file(&Self::metadata_path(&payload_path)).await?;
        Self::remove_file(&payload_path).await
    }
}

impl DistributedCache for FilesystemDistributedCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
        self.fetch(key).boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move { self.store(key, &value, options).await }.boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        self.delete(key).boxed()
    }
}
