use std::any::type_name;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use sentry::{Hub, SentryFutureExt};
use tokio_util::sync::CancellationToken;

use super::distributed::{self, DistributedCache, DistributedEntryOptions};
use super::local::{LocalCache, MokaLocalCache};
use super::options::{MAXIMUM_PAYLOAD_BYTES_LIMIT, ResolvedEntryOptions};
use super::serializer::{
    HybridCacheSerializer, InbuiltSerializerFactory, JsonSerializerFactory, SerializerFactory,
    SerializerResolver, TypedSerializerFactory,
};
use super::stampede::{Registration, StampedeRegistry, StampedeState};
use super::{
    CacheEntry, CacheResult, EntryFlags, EntryOptions, HybridCacheError, HybridCacheOptions,
    StampedeKey,
};
use crate::config::Config;

/// The distributed tier, together with its capabilities.
#[derive(Debug)]
struct DistributedTier {
    cache: Arc<dyn DistributedCache>,
    /// Whether `cache` offers the buffer interface, checked once on construction.
    buffered: bool,
}

impl DistributedTier {
    fn new(cache: Arc<dyn DistributedCache>) -> Self {
        let buffered = cache.as_buffered().is_some();
        Self { cache, buffered }
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        if self.buffered {
            if let Some(buffered) = self.cache.as_buffered() {
                let mut payload = BytesMut::new();
                let found = buffered.try_get_into(key, &mut payload).await?;
                return Ok(found.then(|| payload.freeze()));
            }
        }
        Ok(self.cache.get(key).await?.map(Bytes::from))
    }

    async fn set(
        &self,
        key: &str,
        payload: BytesMut,
        options: DistributedEntryOptions,
    ) -> anyhow::Result<()> {
        if self.buffered {
            if let Some(buffered) = self.cache.as_buffered() {
                return buffered.set_buffer(key, payload.freeze(), options).await;
            }
        }
        self.cache.set(key, payload.to_vec(), options).await
    }
}

#[derive(Debug)]
struct Inner {
    options: HybridCacheOptions,
    defaults: ResolvedEntryOptions,
    local: Arc<dyn LocalCache>,
    distributed: Option<DistributedTier>,
    serializers: SerializerResolver,
    stampedes: Arc<StampedeRegistry>,
}

impl Inner {
    fn is_valid_key(&self, key: &str) -> bool {
        !key.is_empty() && key.len() <= self.options.maximum_key_length
    }

    /// Reads a live, type-compatible value from the local cache.
    fn get_local<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let value = self.local.try_get(key)?;
        let Ok(entry) = value.downcast::<CacheEntry<T>>() else {
            tracing::trace!(key, value_type = type_name::<T>(), "local cache type mismatch");
            return None;
        };
        (!entry.is_expired()).then(|| entry.value().clone())
    }

    fn set_local<T>(&self, key: &str, value: &T, size: u64, options: &ResolvedEntryOptions)
    where
        T: Clone + Send + Sync + 'static,
    {
        if options.flags.contains(EntryFlags::DISABLE_LOCAL_CACHE_WRITE) {
            return;
        }
        let entry = CacheEntry::new(value.clone(), size, options.local_cache_expiration);
        let weight = entry.size();
        self.local.set(
            key,
            Arc::new(entry),
            options.local_cache_expiration,
            weight,
        );
    }

    /// Produces the value for one stampede: from the distributed cache, or the factory.
    async fn fill<S, T, F, Fut>(
        self: Arc<Self>,
        key: String,
        options: ResolvedEntryOptions,
        state: S,
        factory: F,
        token: CancellationToken,
    ) -> CacheResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(S, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let flags = options.flags;

        if let Some(distributed) = &self.distributed {
            if !flags.contains(EntryFlags::DISABLE_DISTRIBUTED_CACHE_READ) {
                let serializer = self.serializers.resolve::<T>()?;
                if let Some(value) = self
                    .read_distributed(distributed, serializer.as_ref(), &key, &options)
                    .await
                {
                    return Ok(value);
                }
            }
        }

        if flags.contains(EntryFlags::DISABLE_UNDERLYING_DATA) {
            return Err(HybridCacheError::NotFound);
        }

        metric!(counter("computation") += 1);
        let start = Instant::now();
        let value = factory(state, token)
            .await
            .map_err(HybridCacheError::factory)?;
        metric!(timer("computation.duration") = start.elapsed());

        self.store(&key, value, &options).await
    }

    /// Looks up `key` in the distributed cache, populating the local cache on a hit.
    ///
    /// Failures are logged and reported as a miss.
    async fn read_distributed<T>(
        &self,
        distributed: &DistributedTier,
        serializer: &dyn HybridCacheSerializer<T>,
        key: &str,
        options: &ResolvedEntryOptions,
    ) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let payload = match distributed.get(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                metric!(counter("distributed.miss") += 1);
                return None;
            }
            Err(err) => {
                let dynerr: &dyn std::error::Error = err.as_ref();
                tracing::error!(error = dynerr, key, "failed to read from distributed cache");
                return None;
            }
        };

        match serializer.deserialize(&payload) {
            Ok(value) => {
                metric!(counter("distributed.hit") += 1);
                tracing::trace!(key, bytes = payload.len(), "distributed cache hit");
                self.set_local(key, &value, payload.len() as u64, options);
                Some(value)
            }
            Err(err) => {
                let dynerr: &dyn std::error::Error = err.as_ref();
                tracing::error!(
                    error = dynerr,
                    key,
                    value_type = type_name::<T>(),
                    "failed to deserialize distributed cache payload"
                );
                None
            }
        }
    }

    /// Writes a freshly produced value to both tiers, as far as `options` allow.
    async fn store<T>(&self, key: &str, value: T, options: &ResolvedEntryOptions) -> CacheResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut size = std::mem::size_of_val(&value) as u64;

        if let Some(distributed) = &self.distributed {
            if !options
                .flags
                .contains(EntryFlags::DISABLE_DISTRIBUTED_CACHE_WRITE)
            {
                let serializer = self.serializers.resolve::<T>()?;
                let mut payload = BytesMut::new();
                serializer
                    .serialize(&value, &mut payload)
                    .map_err(|err| HybridCacheError::Serialization(format!("{err:#}")))?;

                size = payload.len() as u64;
                metric!(time_raw("payload.size") = size);

                let limit = self.options.maximum_payload_bytes;
                if size > limit {
                    metric!(counter("payload_too_large") += 1);
                    tracing::warn!(key, size, limit, "payload exceeds maximum size");
                    return Err(HybridCacheError::PayloadTooLarge { size, limit });
                }

                let distributed_options = DistributedEntryOptions::expiring_after(options.expiration);
                if let Err(err) = distributed.set(key, payload, distributed_options).await {
                    let dynerr: &dyn std::error::Error = err.as_ref();
                    tracing::error!(error = dynerr, key, "failed to write to distributed cache");
                }
            }
        }

        self.set_local(key, &value, size, options);
        Ok(value)
    }
}

/// A two-tier cache with stampede protection.
///
/// Values are looked up in a process-local memory cache first, then in an optional distributed
/// cache, and are finally produced by a caller-provided factory. Concurrent requests for the same
/// key are collapsed into a single fill, whose result is shared by all of them.
///
/// This is cheap to clone, all clones share the same caches and in-flight fills.
#[derive(Debug, Clone)]
pub struct HybridCache {
    inner: Arc<Inner>,
}

impl HybridCache {
    pub fn builder() -> HybridCacheBuilder {
        HybridCacheBuilder::default()
    }

    /// Creates a builder preconfigured from `config`.
    ///
    /// Serializers for application types can be registered on the returned builder.
    pub fn builder_from_config(config: &Config) -> anyhow::Result<HybridCacheBuilder> {
        let mut builder = Self::builder()
            .options(config.cache.clone())
            .local_cache(Arc::new(MokaLocalCache::new(config.local_cache.capacity)));
        if let Some(distributed) = &config.distributed {
            builder = builder.distributed_cache(distributed::from_config(distributed)?);
        }
        Ok(builder)
    }

    /// Creates a cache from `config`, with only the inbuilt serializers.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::builder_from_config(config)?.build()?)
    }

    pub fn options(&self) -> &HybridCacheOptions {
        &self.inner.options
    }

    pub fn has_distributed_cache(&self) -> bool {
        self.inner.distributed.is_some()
    }

    /// Returns the cached value for `key`, or produces and caches it with `factory`.
    ///
    /// Concurrent calls for the same `key` and equivalent read [flags](EntryFlags) share a
    /// single invocation of `factory`, and all observe its value or its error. Errors are not
    /// cached, the next call after a failed fill runs the factory again.
    ///
    /// Cancelling `token` makes only this call return [`HybridCacheError::Cancelled`]. The
    /// factory keeps running as long as any other caller still waits for it, and receives a
    /// token of its own which is cancelled once all callers are gone. Passing `None` means the
    /// call cannot be cancelled; a fill started by such a call runs inline.
    ///
    /// `tags` are accepted for forward compatibility and currently not stored.
    pub async fn get_or_create<S, T, F, Fut>(
        &self,
        key: &str,
        state: S,
        factory: F,
        options: Option<&EntryOptions>,
        tags: &[&str],
        token: Option<&CancellationToken>,
    ) -> CacheResult<T>
    where
        S: Send + 'static,
        T: Clone + Send + Sync + 'static,
        F: FnOnce(S, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(HybridCacheError::Cancelled);
        }
        metric!(counter("access") += 1);

        if !self.inner.is_valid_key(key) {
            metric!(counter("invalid_key") += 1);
            tracing::warn!(
                key_length = key.len(),
                "cache key is empty or too long, bypassing the cache"
            );
            return run_uncached(state, factory, token).await;
        }

        let options = self.inner.defaults.apply(options);

        if !options.flags.contains(EntryFlags::DISABLE_LOCAL_CACHE_READ) {
            if let Some(value) = self.inner.get_local::<T>(key) {
                metric!(counter("local.hit") += 1);
                return Ok(value);
            }
        }

        let stampede_key = StampedeKey::new(key, options.flags);
        match self.inner.stampedes.register::<T>(stampede_key) {
            Registration::Joined(stampede) => {
                metric!(counter("stampede.join") += 1);
                tracing::trace!(key, "joining in-flight fill");
                stampede.wait(token).await
            }
            Registration::Owner { state: stampede, sender } => {
                tracing::trace!(key, ?tags, flags = %options.flags, "starting fill");
                let fill = self.inner.clone().fill(
                    key.to_owned(),
                    options,
                    state,
                    factory,
                    stampede.token().clone(),
                );
                self.drive(stampede, sender, fill, token).await
            }
        }
    }

    /// Writes `value` to both tiers, replacing any existing entry.
    ///
    /// This never joins or feeds a concurrent [`get_or_create`](Self::get_or_create) fill.
    /// Invalid keys are silently skipped.
    pub async fn set<T>(
        &self,
        key: &str,
        value: T,
        options: Option<&EntryOptions>,
        tags: &[&str],
        token: Option<&CancellationToken>,
    ) -> CacheResult<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(HybridCacheError::Cancelled);
        }

        if !self.inner.is_valid_key(key) {
            metric!(counter("invalid_key") += 1);
            tracing::warn!(
                key_length = key.len(),
                "cache key is empty or too long, not caching"
            );
            return Ok(());
        }

        let mut options = self.inner.defaults.apply(options);
        options.flags |=
            EntryFlags::DISABLE_LOCAL_CACHE_READ | EntryFlags::DISABLE_DISTRIBUTED_CACHE_READ;
        options.flags.remove(EntryFlags::DISABLE_UNDERLYING_DATA);
        tracing::trace!(key, ?tags, "setting entry");

        let (stampede, sender) =
            StampedeState::unregistered(StampedeKey::new(key, options.flags));
        let fill = self.inner.clone().fill(
            key.to_owned(),
            options,
            value,
            |value, _token| async move { Ok::<_, anyhow::Error>(value) },
            stampede.token().clone(),
        );
        self.drive(stampede, sender, fill, token).await.map(|_| ())
    }

    /// Removes `key` from both tiers.
    ///
    /// This neither waits for nor cancels fills that are in flight for `key`. Such a fill can
    /// repopulate the entry right after it was removed.
    pub async fn remove_key(&self, key: &str, token: Option<&CancellationToken>) -> CacheResult<()> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(HybridCacheError::Cancelled);
        }

        self.inner.local.remove(key);

        if let Some(distributed) = &self.inner.distributed {
            let removal = distributed.cache.remove(key);
            let result = match token {
                Some(token) => tokio::select! {
                    biased;
                    result = removal => result,
                    _ = token.cancelled() => return Err(HybridCacheError::Cancelled),
                },
                None => removal.await,
            };
            result.map_err(HybridCacheError::distributed)?;
        }

        tracing::trace!(key, "removed entry");
        Ok(())
    }

    /// Removes all entries carrying `tag`.
    ///
    /// Tags are not tracked, so this does nothing. Entries can only be removed by key.
    pub async fn remove_tag(&self, tag: &str, token: Option<&CancellationToken>) -> CacheResult<()> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(HybridCacheError::Cancelled);
        }
        tracing::trace!(tag, "tag based removal is not supported");
        Ok(())
    }

    /// Runs `fill` for a stampede that this caller owns, and waits for its result.
    ///
    /// A cancellable caller spawns the fill so that it can outlive the caller. Otherwise the
    /// fill runs inline.
    async fn drive<T, Fut>(
        &self,
        stampede: Arc<StampedeState<T>>,
        sender: tokio::sync::oneshot::Sender<CacheResult<T>>,
        fill: Fut,
        token: Option<&CancellationToken>,
    ) -> CacheResult<T>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let publish = stampede
            .clone()
            .run(self.inner.stampedes.clone(), sender, fill);

        match token {
            Some(token) => {
                tokio::spawn(publish.bind_hub(Hub::new_from_top(Hub::current())));
                stampede.wait(Some(token)).await
            }
            None => {
                publish.await;
                stampede.wait(None).await
            }
        }
    }
}

/// Invokes `factory` without involving any cache tier.
async fn run_uncached<S, T, F, Fut>(
    state: S,
    factory: F,
    token: Option<&CancellationToken>,
) -> CacheResult<T>
where
    F: FnOnce(S, CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let factory_token = token.map(CancellationToken::child_token).unwrap_or_default();
    let computation = factory(state, factory_token);
    let result = match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => return Err(HybridCacheError::Cancelled),
            result = computation => result,
        },
        None => computation.await,
    };
    result.map_err(HybridCacheError::factory)
}

/// Builds a [`HybridCache`].
///
/// The inbuilt serializers for `String`, `Vec<u8>` and `Bytes` are always registered first, so
/// every serializer registered here takes precedence over them. Among the registered ones, the
/// last registration for a type wins.
#[derive(Debug, Default)]
pub struct HybridCacheBuilder {
    options: HybridCacheOptions,
    local: Option<Arc<dyn LocalCache>>,
    distributed: Option<Arc<dyn DistributedCache>>,
    factories: Vec<Arc<dyn SerializerFactory>>,
}

impl HybridCacheBuilder {
    pub fn options(mut self, options: HybridCacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the local tier. Defaults to a [`MokaLocalCache`] with the default capacity.
    pub fn local_cache(mut self, local: Arc<dyn LocalCache>) -> Self {
        self.local = Some(local);
        self
    }

    /// Sets the distributed tier. Without one, only the local tier is used.
    pub fn distributed_cache(mut self, distributed: Arc<dyn DistributedCache>) -> Self {
        self.distributed = Some(distributed);
        self
    }

    pub fn serializer_factory(mut self, factory: Arc<dyn SerializerFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Registers `serializer` for values of type `T`.
    pub fn serializer<T: 'static>(self, serializer: Arc<dyn HybridCacheSerializer<T>>) -> Self {
        self.serializer_factory(Arc::new(TypedSerializerFactory::new(serializer)))
    }

    /// Serializes values of type `T` as JSON.
    pub fn with_json<T>(self) -> Self
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.serializer_factory(Arc::new(JsonSerializerFactory::new().with::<T>()))
    }

    pub fn build(self) -> CacheResult<HybridCache> {
        let options = self.options;

        if options.maximum_payload_bytes == 0
            || options.maximum_payload_bytes > MAXIMUM_PAYLOAD_BYTES_LIMIT
        {
            return Err(HybridCacheError::InvalidOptions(format!(
                "maximum_payload_bytes must be between 1 and {MAXIMUM_PAYLOAD_BYTES_LIMIT}, got {}",
                options.maximum_payload_bytes
            )));
        }
        if options.maximum_key_length == 0 {
            return Err(HybridCacheError::InvalidOptions(
                "maximum_key_length must not be zero".into(),
            ));
        }

        let mut factories: Vec<Arc<dyn SerializerFactory>> =
            vec![Arc::new(InbuiltSerializerFactory)];
        factories.extend(self.factories);

        let local = self
            .local
            .unwrap_or_else(|| Arc::new(MokaLocalCache::default()));
        let distributed = self.distributed.map(DistributedTier::new);

        tracing::debug!(
            distributed = distributed.is_some(),
            buffered = distributed.as_ref().is_some_and(|tier| tier.buffered),
            "created hybrid cache"
        );

        let inner = Inner {
            defaults: ResolvedEntryOptions::defaults(&options),
            options,
            local,
            distributed,
            serializers: SerializerResolver::new(factories),
            stampedes: Arc::default(),
        };
        Ok(HybridCache {
            inner: Arc::new(inner),
        })
    }
}
