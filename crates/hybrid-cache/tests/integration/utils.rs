use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hybrid_cache::caching::{FilesystemDistributedCache, HybridCache};

/// Creates a cache whose distributed tier lives in `dir`.
///
/// Every cache created for the same `dir` behaves like a separate process sharing that tier.
pub fn filesystem_cache(dir: &Path) -> HybridCache {
    let distributed = FilesystemDistributedCache::new(dir.to_owned()).unwrap();
    HybridCache::builder()
        .distributed_cache(Arc::new(distributed))
        .with_json::<Vec<String>>()
        .build()
        .unwrap()
}

/// A shared counter of factory invocations.
#[derive(Debug, Clone, Default)]
pub struct Computations(Arc<AtomicUsize>);

impl Computations {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Counts one invocation, and resolves to `value` after `delay`.
    pub async fn compute<T>(self, delay: Duration, value: T) -> anyhow::Result<T> {
        self.0.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(value)
    }
}
