//! Helpers for testing code built on the [`HybridCache`](crate::caching::HybridCache).
//!
//!  - [`RecordingDistributedCache`] wraps another distributed cache, counts the operations
//!    issued against it, and can be told to fail them.
//!
//!  - [`CallCounter`] hands out factory futures that count their invocations, optionally
//!    taking some time to complete.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};

use crate::caching::{
    BufferDistributedCache, DistributedCache, DistributedEntryOptions, MemoryDistributedCache,
};

/// A [`DistributedCache`] that records all operations issued against it.
#[derive(Debug)]
pub struct RecordingDistributedCache {
    inner: Arc<dyn DistributedCache>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    removes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl RecordingDistributedCache {
    pub fn new(inner: Arc<dyn DistributedCache>) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Records operations against a fresh [`MemoryDistributedCache`].
    pub fn memory() -> Arc<Self> {
        Arc::new(Self::new(Arc::new(MemoryDistributedCache::new())))
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::Relaxed)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::Relaxed)
    }

    /// Makes all following reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes all following writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Reads a payload without recording the access.
    pub async fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.get(key).await.ok().flatten()
    }
}

impl DistributedCache for RecordingDistributedCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return async { Err(anyhow::anyhow!("injected read failure")) }.boxed();
        }
        self.inner.get(key)
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.sets.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return async { Err(anyhow::anyhow!("injected write failure")) }.boxed();
        }
        self.inner.set(key, value, options)
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.inner.remove(key)
    }
}

/// A [`RecordingDistributedCache`] that also offers the buffer interface of its inner cache.
#[derive(Debug)]
pub struct BufferedRecordingDistributedCache {
    recording: RecordingDistributedCache,
    inner: Arc<MemoryDistributedCache>,
    buffered_gets: AtomicUsize,
    buffered_sets: AtomicUsize,
}

impl BufferedRecordingDistributedCache {
    /// Records operations against a fresh [`MemoryDistributedCache`].
    pub fn memory() -> Arc<Self> {
        let inner = Arc::new(MemoryDistributedCache::new());
        Arc::new(Self {
            recording: RecordingDistributedCache::new(inner.clone()),
            inner,
            buffered_gets: AtomicUsize::new(0),
            buffered_sets: AtomicUsize::new(0),
        })
    }

    /// Operations that went through the plain, copying interface.
    pub fn recording(&self) -> &RecordingDistributedCache {
        &self.recording
    }

    pub fn buffered_gets(&self) -> usize {
        self.buffered_gets.load(Ordering::Relaxed)
    }

    pub fn buffered_sets(&self) -> usize {
        self.buffered_sets.load(Ordering::Relaxed)
    }
}

impl DistributedCache for BufferedRecordingDistributedCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
        self.recording.get(key)
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.recording.set(key, value, options)
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        self.recording.remove(key)
    }

    fn as_buffered(&self) -> Option<&dyn BufferDistributedCache> {
        Some(self)
    }
}

impl BufferDistributedCache for BufferedRecordingDistributedCache {
    fn try_get_into<'a>(
        &'a self,
        key: &'a str,
        target: &'a mut BytesMut,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        self.buffered_gets.fetch_add(1, Ordering::Relaxed);
        self.inner.try_get_into(key, target)
    }

    fn set_buffer<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        options: DistributedEntryOptions,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.buffered_sets.fetch_add(1, Ordering::Relaxed);
        self.inner.set_buffer(key, value, options)
    }
}

/// Counts factory invocations.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// A factory future that resolves to `value` after `delay`.
    pub fn compute<T>(&self, delay: Duration, value: T) -> BoxFuture<'static, anyhow::Result<T>>
    where
        T: Send + 'static,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(value)
        }
        .boxed()
    }

    /// A factory future that fails with `message` after `delay`.
    pub fn fail<T>(
        &self,
        delay: Duration,
        message: &'static str,
    ) -> BoxFuture<'static, anyhow::Result<T>>
    where
        T: Send + 'static,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Err(anyhow::anyhow!(message))
        }
        .boxed()
    }
}
