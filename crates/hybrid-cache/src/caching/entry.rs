use std::time::{Duration, Instant};

/// Stand-in for "never" when an expiration does not fit into an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// A materialized cache value together with its bookkeeping metadata.
///
/// Entries are immutable once created. They are shared behind an `Arc` between the local
/// in-memory cache and every caller that joined the fill which produced them.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: T,
    /// Approximate size in bytes, used for payload limits and in-memory weighing.
    size: u64,
    /// When this entry should drop out of the local in-memory cache.
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    /// Creates an entry that expires from the local cache after `local_expiration`.
    pub fn new(value: T, size: u64, local_expiration: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now
            .checked_add(local_expiration)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self {
            value,
            size,
            expires_at,
        }
    }

    /// Returns a reference to the cached value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The approximate size of this entry in bytes.
    ///
    /// For values that went through a serializer this is the payload length, otherwise the
    /// in-memory size of the value itself.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}
