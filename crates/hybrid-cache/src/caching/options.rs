use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// The default overall expiration of an entry, used for the distributed cache.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// The default expiration of an entry in the local in-memory cache.
pub const DEFAULT_LOCAL_CACHE_EXPIRATION: Duration = Duration::from_secs(60);

/// Payloads above this size are rejected before they are written to the distributed cache.
pub const DEFAULT_MAXIMUM_PAYLOAD_BYTES: u64 = 1024 * 1024;

/// The hard upper limit for [`HybridCacheOptions::maximum_payload_bytes`].
pub const MAXIMUM_PAYLOAD_BYTES_LIMIT: u64 = i32::MAX as u64;

/// Keys longer than this are not cached by default.
pub const DEFAULT_MAXIMUM_KEY_LENGTH: usize = 1024;

bitflags! {
    /// Per-entry switches controlling which tiers an operation may read from or write to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        /// Do not read from the local in-memory cache.
        const DISABLE_LOCAL_CACHE_READ = 1 << 0;
        /// Do not write to the local in-memory cache.
        const DISABLE_LOCAL_CACHE_WRITE = 1 << 1;
        /// Neither read from nor write to the local in-memory cache.
        const DISABLE_LOCAL_CACHE = Self::DISABLE_LOCAL_CACHE_READ.bits()
            | Self::DISABLE_LOCAL_CACHE_WRITE.bits();
        /// Do not read from the distributed cache.
        const DISABLE_DISTRIBUTED_CACHE_READ = 1 << 2;
        /// Do not write to the distributed cache.
        const DISABLE_DISTRIBUTED_CACHE_WRITE = 1 << 3;
        /// Neither read from nor write to the distributed cache.
        const DISABLE_DISTRIBUTED_CACHE = Self::DISABLE_DISTRIBUTED_CACHE_READ.bits()
            | Self::DISABLE_DISTRIBUTED_CACHE_WRITE.bits();
        /// Never invoke the underlying data factory; a miss in both tiers is reported as
        /// [`NotFound`](crate::caching::HybridCacheError::NotFound).
        const DISABLE_UNDERLYING_DATA = 1 << 4;
    }
}

impl EntryFlags {
    /// The flags which change what an operation can *observe*.
    ///
    /// Only these take part in stampede deduplication.
    pub const VISIBILITY: Self = Self::DISABLE_LOCAL_CACHE_READ
        .union(Self::DISABLE_DISTRIBUTED_CACHE_READ);
}

impl fmt::Display for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for EntryFlags {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = EntryFlags::empty();
        for name in s.split('|').map(str::trim).filter(|name| !name.is_empty()) {
            if name.eq_ignore_ascii_case("none") {
                continue;
            }
            let upper = name.to_ascii_uppercase();
            flags |= EntryFlags::from_name(&upper)
                .ok_or_else(|| format!("unknown entry flag `{name}`"))?;
        }
        Ok(flags)
    }
}

// Flags are written as their names joined with `|`, which keeps config files readable.
impl Serialize for EntryFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Options for a single cache entry.
///
/// Every field is optional; unset fields fall back to
/// [`HybridCacheOptions::default_entry_options`] and finally to the built-in defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryOptions {
    /// Overall lifetime of the entry, applied to the distributed cache.
    #[serde(with = "humantime_serde")]
    pub expiration: Option<Duration>,

    /// Lifetime of the entry in the local in-memory cache.
    ///
    /// This is clamped so that it never exceeds [`expiration`](Self::expiration).
    #[serde(with = "humantime_serde")]
    pub local_cache_expiration: Option<Duration>,

    /// Tier switches for this entry.
    pub flags: Option<EntryFlags>,
}

impl EntryOptions {
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_local_cache_expiration(mut self, expiration: Duration) -> Self {
        self.local_cache_expiration = Some(expiration);
        self
    }

    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags = Some(flags);
        self
    }
}

/// Process-wide cache configuration.
///
/// This is read-only once a [`HybridCache`](crate::caching::HybridCache) has been built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridCacheOptions {
    /// Defaults for entries that do not specify their own [`EntryOptions`].
    pub default_entry_options: EntryOptions,

    /// The maximum size of a serialized payload.
    ///
    /// Values which serialize to more bytes than this fail with
    /// [`PayloadTooLarge`](crate::caching::HybridCacheError::PayloadTooLarge) and are never
    /// written to the distributed cache. Limited to 2 GiB.
    pub maximum_payload_bytes: u64,

    /// The maximum length of a cache key.
    ///
    /// Longer keys bypass the cache entirely.
    pub maximum_key_length: usize,
}

impl Default for HybridCacheOptions {
    fn default() -> Self {
        Self {
            default_entry_options: EntryOptions::default(),
            maximum_payload_bytes: DEFAULT_MAXIMUM_PAYLOAD_BYTES,
            maximum_key_length: DEFAULT_MAXIMUM_KEY_LENGTH,
        }
    }
}

/// [`EntryOptions`] with all defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedEntryOptions {
    pub expiration: Duration,
    pub local_cache_expiration: Duration,
    pub flags: EntryFlags,
}

impl ResolvedEntryOptions {
    /// Resolves the process-wide defaults.
    pub fn defaults(options: &HybridCacheOptions) -> Self {
        let defaults = &options.default_entry_options;
        let expiration = defaults.expiration.unwrap_or(DEFAULT_EXPIRATION);
        let local_cache_expiration = defaults
            .local_cache_expiration
            .unwrap_or(DEFAULT_LOCAL_CACHE_EXPIRATION);
        Self {
            expiration,
            local_cache_expiration: local_cache_expiration.min(expiration),
            flags: defaults.flags.unwrap_or_default(),
        }
    }

    /// Layers per-call options on top of `self`.
    pub fn apply(self, options: Option<&EntryOptions>) -> Self {
        let Some(options) = options else {
            return self;
        };
        let expiration = options.expiration.unwrap_or(self.expiration);
        let local_cache_expiration = options
            .local_cache_expiration
            .unwrap_or(self.local_cache_expiration);
        Self {
            expiration,
            local_cache_expiration: local_cache_expiration.min(expiration),
            flags: options.flags.unwrap_or(self.flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_parse() {
        let flags: EntryFlags = "DISABLE_LOCAL_CACHE_READ | disable_distributed_cache"
            .parse()
            .unwrap();
        assert_eq!(
            flags,
            EntryFlags::DISABLE_LOCAL_CACHE_READ | EntryFlags::DISABLE_DISTRIBUTED_CACHE
        );

        assert_eq!("none".parse::<EntryFlags>().unwrap(), EntryFlags::empty());
        assert!("DISABLE_EVERYTHING".parse::<EntryFlags>().is_err());
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(EntryFlags::empty().to_string(), "NONE");
        assert_eq!(
            EntryFlags::DISABLE_LOCAL_CACHE_WRITE.to_string(),
            "DISABLE_LOCAL_CACHE_WRITE"
        );

        let flags = EntryFlags::DISABLE_LOCAL_CACHE_READ | EntryFlags::DISABLE_UNDERLYING_DATA;
        assert_eq!(flags.to_string().parse::<EntryFlags>().unwrap(), flags);
    }

    #[test]
    fn test_resolve_defaults() {
        let resolved = ResolvedEntryOptions::defaults(&HybridCacheOptions::default());
        assert_eq!(resolved.expiration, DEFAULT_EXPIRATION);
        assert_eq!(
            resolved.local_cache_expiration,
            DEFAULT_LOCAL_CACHE_EXPIRATION
        );
        assert_eq!(resolved.flags, EntryFlags::empty());
    }

    #[test]
    fn test_local_expiration_is_clamped() {
        let defaults = ResolvedEntryOptions::defaults(&HybridCacheOptions::default());

        let options = EntryOptions::default().with_expiration(Duration::from_secs(10));
        let resolved = defaults.apply(Some(&options));
        assert_eq!(resolved.expiration, Duration::from_secs(10));
        assert_eq!(resolved.local_cache_expiration, Duration::from_secs(10));

        let options = EntryOptions::default()
            .with_flags(EntryFlags::DISABLE_LOCAL_CACHE)
            .with_local_cache_expiration(Duration::from_secs(5));
        let resolved = defaults.apply(Some(&options));
        assert_eq!(resolved.expiration, DEFAULT_EXPIRATION);
        assert_eq!(resolved.local_cache_expiration, Duration::from_secs(5));
        assert_eq!(resolved.flags, EntryFlags::DISABLE_LOCAL_CACHE);
    }
}
