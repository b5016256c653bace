use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The default capacity of the local in-memory cache, in bytes.
pub const DEFAULT_LOCAL_CACHE_CAPACITY: u64 = 100 * 1024 * 1024;

/// A type-erased value stored in a [`LocalCache`].
///
/// The [`HybridCache`](super::HybridCache) stores a [`CacheEntry`](super::CacheEntry) of the
/// requested type, and treats a value of any other type as a miss.
pub type LocalValue = Arc<dyn Any + Send + Sync>;

/// The process-local, in-memory tier.
///
/// Implementations must be safe for concurrent use, and are expected to evict entries on their
/// own once their expiration elapses or when running out of capacity.
pub trait LocalCache: Send + Sync + fmt::Debug {
    /// Looks up a live entry.
    fn try_get(&self, key: &str) -> Option<LocalValue>;

    /// Inserts or replaces an entry which expires after `expiration`.
    ///
    /// `size` is the approximate size of the value in bytes, and may be used for weighing.
    fn set(&self, key: &str, value: LocalValue, expiration: Duration, size: u64);

    /// Removes an entry if it exists.
    fn remove(&self, key: &str);
}

/// An item saved in the in-memory moka cache.
#[derive(Clone)]
struct LocalItem {
    /// When to evict this item from the in-memory cache.
    deadline: Instant,
    /// The weight of the value, in bytes.
    weight: u32,
    value: LocalValue,
}

/// A struct implementing [`moka::Expiry`] that uses the [`LocalItem`] [`Instant`] as the explicit
/// expiration time.
struct LocalExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<Arc<str>, LocalItem> for LocalExpiration {
    fn expire_after_create(
        &self,
        _key: &Arc<str>,
        value: &LocalItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &Arc<str>,
        value: &LocalItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// A [`LocalCache`] backed by a size-bounded [`moka`] cache.
#[derive(Clone)]
pub struct MokaLocalCache {
    cache: moka::sync::Cache<Arc<str>, LocalItem>,
}

impl MokaLocalCache {
    /// Creates a cache holding up to roughly `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .name("hybrid_cache.local")
            .expire_after(LocalExpiration)
            // NOTE: we count all the bookkeeping structures to the weight as well
            .weigher(|_k, v: &LocalItem| {
                (std::mem::size_of::<(Arc<str>, Instant)>() as u32).saturating_add(v.weight)
            })
            .build();

        Self { cache }
    }

    /// The number of entries currently held.
    ///
    /// This is an estimate, as evictions are processed lazily.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for MokaLocalCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_CACHE_CAPACITY)
    }
}

impl fmt::Debug for MokaLocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaLocalCache")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl LocalCache for MokaLocalCache {
    fn try_get(&self, key: &str) -> Option<LocalValue> {
        let item = self.cache.get(key)?;
        // moka may hand out an entry that expired since its last maintenance run
        (item.deadline > Instant::now()).then_some(item.value)
    }

    fn set(&self, key: &str, value: LocalValue, expiration: Duration, size: u64) {
        let now = Instant::now();
        let Some(deadline) = now.checked_add(expiration) else {
            tracing::trace!(key, "local expiration out of range, not caching");
            return;
        };
        let item = LocalItem {
            deadline,
            weight: u32::try_from(size).unwrap_or(u32::MAX),
            value,
        };
        self.cache.insert(key.into(), item);
    }

    fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }
}
