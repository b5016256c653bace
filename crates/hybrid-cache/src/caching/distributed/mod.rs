//! The out-of-process, shared tier.
//!
//! The [`HybridCache`](super::HybridCache) talks to this tier through the [`DistributedCache`]
//! trait, which only deals in opaque byte payloads. Backends may additionally implement
//! [`BufferDistributedCache`] to avoid copying payloads around.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;

mod config;
mod filesystem;
mod memory;

pub use config::{DistributedCacheConfig, FilesystemDistributedCacheConfig};
pub use filesystem::FilesystemDistributedCache;
pub use memory::MemoryDistributedCache;

/// Per-write options for the distributed cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributedEntryOptions {
    /// The entry should expire after this much time has passed.
    pub absolute_expiration_relative_to_now: Option<Duration>,
}

impl DistributedEntryOptions {
    pub fn expiring_after(expiration: Duration) -> Self {
        Self {
            absolute_expiration_relative_to_now: Some(expiration),
        }
    }
}

/// A distributed key/value store for serialized payloads.
///
/// Errors are reported, but the [`HybridCache`](super::HybridCache) treats failed reads as
/// misses and failed writes as non-fatal. Operations are cancelled by dropping their future.
pub trait DistributedCache: Send + Sync + fmt::Debug {
    /// Reads the payload stored under `key`, or `None` if there is none.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>>;

    /// Stores `value` under `key`, replacing any previous payload.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Removes the payload stored under `key`.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Returns the buffer-oriented interface of this backend, if it has one.
    fn as_buffered(&self) -> Option<&dyn BufferDistributedCache> {
        None
    }
}

/// A [`DistributedCache`] that can read into and write from caller-provided buffers.
pub trait BufferDistributedCache: Send + Sync {
    /// Appends the payload stored under `key` to `target`.
    ///
    /// Returns `false` if there is no such payload, in which case `target` is left untouched.
    fn try_get_into<'a>(
        &'a self,
        key: &'a str,
        target: &'a mut BytesMut,
    ) -> BoxFuture<'a, anyhow::Result<bool>>;

    /// Stores `value` under `key` without copying it.
    fn set_buffer<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Creates the backend described by `config`.
pub fn from_config(config: &DistributedCacheConfig) -> anyhow::Result<Arc<dyn DistributedCache>> {
    Ok(match config {
        DistributedCacheConfig::Memory => Arc::new(MemoryDistributedCache::new()),
        DistributedCacheConfig::Filesystem(cfg) => {
            Arc::new(FilesystemDistributedCache::new(cfg.path.clone())?)
        }
    })
}
