//! # Hybrid caching
//!
//! This module contains the [`HybridCache`], a two-tier cache with stampede protection, together
//! with the tiers it is built from and our central [`HybridCacheError`] type.
//!
//! ## Cache Layers
//!
//! - A process-local in-memory layer ([`LocalCache`]), backed by [`moka`] by default. It holds
//!   materialized values and is consulted first.
//! - An optional distributed layer ([`DistributedCache`]) holding serialized payloads. It can be
//!   shared between processes, and is meant to absorb the cost of cold local caches.
//!
//! A `get_or_create` request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it joins a concurrent fill for the same key, if there is one.
//! - Otherwise it starts a fill, which tries the distributed layer next.
//! - On miss, it will finally invoke the factory to generate a fresh value.
//! - The freshly computed value is written to the distributed layer and to the in-memory layer,
//!   before any waiting caller is handed the result.
//!
//! Errors are never cached. A failed fill is reported to every caller that joined it, and the
//! next request runs a fresh fill.
//!
//! ### Metrics
//!
//! Metric names are relative to the configured statsd prefix, `hybrid_cache` by default:
//!
//! - `access`: All `get_or_create` calls.
//! - `local.hit`: Accesses served by the in-memory layer.
//! - `distributed.hit` / `distributed.miss`: Lookups in the distributed layer.
//! - `stampede.join`: Accesses that joined a fill already in flight.
//! - `computation`: Actual factory invocations, and `computation.duration` for their runtime.
//! - `payload.size`: A histogram of serialized payload sizes.
//! - `payload_too_large`: Values rejected because their payload exceeds the configured maximum.
//! - `invalid_key`: Operations bypassing the cache because of an empty or overly long key.
//!
//! ### Configuration
//!
//! Defaults for entries are configured through [`HybridCacheOptions`], and can be overridden per
//! call with [`EntryOptions`]. [`EntryFlags`] selectively disable reading from or writing to each
//! of the layers.

mod cache_error;
mod distributed;
mod entry;
mod hybrid;
mod local;
mod options;
mod serializer;
mod stampede;
mod stampede_key;

pub use cache_error::{CacheResult, HybridCacheError};
pub use distributed::{
    BufferDistributedCache, DistributedCache, DistributedCacheConfig, DistributedEntryOptions,
    FilesystemDistributedCache, FilesystemDistributedCacheConfig, MemoryDistributedCache,
    from_config as distributed_cache_from_config,
};
pub use entry::CacheEntry;
pub use hybrid::{HybridCache, HybridCacheBuilder};
pub use local::{DEFAULT_LOCAL_CACHE_CAPACITY, LocalCache, LocalValue, MokaLocalCache};
pub use options::*;
pub use serializer::{
    BytesSerializer, ErasedSerializer, HybridCacheSerializer, InbuiltSerializerFactory,
    JsonSerializer, JsonSerializerFactory, SerializerFactory, StringSerializer,
    TypedSerializerFactory, erase as erase_serializer,
};
pub use stampede_key::StampedeKey;
