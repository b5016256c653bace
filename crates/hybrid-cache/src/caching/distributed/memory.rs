use std::collections::HashMap;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use super::{BufferDistributedCache, DistributedCache, DistributedEntryOptions};

#[derive(Debug)]
struct StoredPayload {
    payload: Bytes,
    expires_at: Option<Instant>,
}

impl StoredPayload {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// A [`DistributedCache`] that keeps payloads in a process-local map.
///
/// This is a stand-in for a real distributed store. It honors expirations, and supports the
/// buffer interface.
#[derive(Debug, Default)]
pub struct MemoryDistributedCache {
    entries: Mutex<HashMap<String, StoredPayload>>,
}

impl MemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live payloads.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, stored| stored.is_live(now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.is_live(now) => Some(stored.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, payload: Bytes, options: DistributedEntryOptions) {
        let expires_at = options
            .absolute_expiration_relative_to_now
            .and_then(|expiration| Instant::now().checked_add(expiration));
        self.entries.lock().insert(
            key.to_owned(),
            StoredPayload {
                payload,
                expires_at,
            },
        );
    }
}

impl DistributedCache for MemoryDistributedCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
        let payload = self.lookup(key).map(|payload| payload.to_vec());
        async move { Ok(payload) }.boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.store(key, value.into(), options);
        async { Ok(()) }.boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        self.entries.lock().remove(key);
        async { Ok(()) }.boxed()
    }

    fn as_buffered(&self) -> Option<&dyn BufferDistributedCache> {
        Some(self)
    }
}

impl BufferDistributedCache for MemoryDistributedCache {
    fn try_get_into<'a>(
        &'a self,
        key: &'a str,
        target: &'a mut BytesMut,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        let found = match self.lookup(key) {
            Some(payload) => {
                target.extend_from_slice(&payload);
                true
            }
            None => false,
        };
        async move { Ok(found) }.boxed()
    }

    fn set_buffer<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.store(key, value, options);
        async { Ok(()) }.boxed()
    }
}
