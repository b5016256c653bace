//! Pluggable serialization of values for the distributed cache.
//!
//! Values are only ever serialized when they travel to or from the distributed cache. Which
//! serializer handles a type is decided by a list of [`SerializerFactory`]s, where the factory
//! registered *last* wins. The result of that lookup is memoized per type.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{CacheResult, HybridCacheError};

/// Converts values of type `T` to and from bytes.
pub trait HybridCacheSerializer<T>: Send + Sync {
    /// Appends the serialized form of `value` to `target`.
    fn serialize(&self, value: &T, target: &mut BytesMut) -> anyhow::Result<()>;

    /// Reads a value back from its serialized form.
    fn deserialize(&self, source: &[u8]) -> anyhow::Result<T>;
}

/// A type-erased `Arc<dyn HybridCacheSerializer<T>>`.
pub type ErasedSerializer = Arc<dyn Any + Send + Sync>;

/// Erases the type of `serializer`.
pub fn erase<T: 'static>(serializer: Arc<dyn HybridCacheSerializer<T>>) -> ErasedSerializer {
    Arc::new(serializer)
}

/// Produces serializers for the types it supports.
pub trait SerializerFactory: Send + Sync + fmt::Debug {
    /// Returns a serializer for the type identified by `type_id`, if this factory supports it.
    ///
    /// The returned value must have been produced by [`erase`] for that same type.
    fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer>;
}

/// Passes strings through as UTF-8.
#[derive(Debug, Default)]
pub struct StringSerializer;

impl HybridCacheSerializer<String> for StringSerializer {
    fn serialize(&self, value: &String, target: &mut BytesMut) -> anyhow::Result<()> {
        target.put_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, source: &[u8]) -> anyhow::Result<String> {
        Ok(std::str::from_utf8(source)?.to_owned())
    }
}

/// Passes raw bytes through unchanged.
#[derive(Debug, Default)]
pub struct BytesSerializer;

impl HybridCacheSerializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>, target: &mut BytesMut) -> anyhow::Result<()> {
        target.put_slice(value);
        Ok(())
    }

    fn deserialize(&self, source: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(source.to_vec())
    }
}

impl HybridCacheSerializer<Bytes> for BytesSerializer {
    fn serialize(&self, value: &Bytes, target: &mut BytesMut) -> anyhow::Result<()> {
        target.put_slice(value);
        Ok(())
    }

    fn deserialize(&self, source: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Bytes::copy_from_slice(source))
    }
}

/// Serializers for [`String`], `Vec<u8>` and [`Bytes`].
///
/// This factory is always registered first, so any other factory can override it.
#[derive(Debug, Default)]
pub struct InbuiltSerializerFactory;

impl SerializerFactory for InbuiltSerializerFactory {
    fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer> {
        if type_id == TypeId::of::<String>() {
            Some(erase::<String>(Arc::new(StringSerializer)))
        } else if type_id == TypeId::of::<Vec<u8>>() {
            Some(erase::<Vec<u8>>(Arc::new(BytesSerializer)))
        } else if type_id == TypeId::of::<Bytes>() {
            Some(erase::<Bytes>(Arc::new(BytesSerializer)))
        } else {
            None
        }
    }
}

/// Serializes any serde-compatible type as JSON.
pub struct JsonSerializer<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonSerializer<{}>", type_name::<T>())
    }
}

impl<T> HybridCacheSerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, target: &mut BytesMut) -> anyhow::Result<()> {
        serde_json::to_writer(target.writer(), value)?;
        Ok(())
    }

    fn deserialize(&self, source: &[u8]) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(source)?)
    }
}

/// Serializes every registered type as JSON.
///
/// Rust has no runtime reflection, so types have to be opted in via [`with`](Self::with).
#[derive(Default)]
pub struct JsonSerializerFactory {
    types: FxHashMap<TypeId, (&'static str, fn() -> ErasedSerializer)>,
}

impl JsonSerializerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` to be serialized as JSON.
    pub fn with<T>(mut self) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let create: fn() -> ErasedSerializer =
            || erase::<T>(Arc::new(JsonSerializer::<T>::default()));
        self.types
            .insert(TypeId::of::<T>(), (type_name::<T>(), create));
        self
    }
}

impl fmt::Debug for JsonSerializerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.types.values().map(|(name, _)| *name).collect();
        types.sort_unstable();
        f.debug_struct("JsonSerializerFactory")
            .field("types", &types)
            .finish()
    }
}

impl SerializerFactory for JsonSerializerFactory {
    fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer> {
        self.types.get(&type_id).map(|(_, create)| create())
    }
}

/// A factory handing out one fixed serializer for exactly one type.
pub struct TypedSerializerFactory<T> {
    serializer: Arc<dyn HybridCacheSerializer<T>>,
}

impl<T> TypedSerializerFactory<T> {
    pub fn new(serializer: Arc<dyn HybridCacheSerializer<T>>) -> Self {
        Self { serializer }
    }
}

impl<T> fmt::Debug for TypedSerializerFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedSerializerFactory<{}>", type_name::<T>())
    }
}

impl<T: 'static> SerializerFactory for TypedSerializerFactory<T> {
    fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer> {
        (type_id == TypeId::of::<T>()).then(|| erase(self.serializer.clone()))
    }
}

/// Resolves and memoizes the serializer for each value type.
pub(crate) struct SerializerResolver {
    /// Ordered by precedence, the last registered factory comes first.
    factories: Vec<Arc<dyn SerializerFactory>>,
    resolved: RwLock<FxHashMap<TypeId, ErasedSerializer>>,
}

impl fmt::Debug for SerializerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerResolver")
            .field("factories", &self.factories)
            .field("resolved", &self.resolved.read().len())
            .finish()
    }
}

impl SerializerResolver {
    /// Creates a resolver from factories in registration order.
    pub fn new(mut factories: Vec<Arc<dyn SerializerFactory>>) -> Self {
        factories.reverse();
        Self {
            factories,
            resolved: Default::default(),
        }
    }

    /// Returns the serializer for `T`.
    pub fn resolve<T: 'static>(&self) -> CacheResult<Arc<dyn HybridCacheSerializer<T>>> {
        let type_id = TypeId::of::<T>();

        let cached = self.resolved.read().get(&type_id).cloned();
        let erased = match cached {
            Some(erased) => erased,
            None => {
                let erased = self
                    .factories
                    .iter()
                    .find_map(|factory| factory.try_create(type_id))
                    .ok_or(HybridCacheError::NoSerializer(type_name::<T>()))?;
                tracing::trace!(value_type = type_name::<T>(), "resolved serializer");
                // Two racing resolutions produce equivalent serializers, keep the first one.
                self.resolved
                    .write()
                    .entry(type_id)
                    .or_insert(erased)
                    .clone()
            }
        };

        erased
            .downcast_ref::<Arc<dyn HybridCacheSerializer<T>>>()
            .cloned()
            .ok_or(HybridCacheError::NoSerializer(type_name::<T>()))
    }

    /// The number of types resolved so far.
    #[cfg(test)]
    pub fn resolved_len(&self) -> usize {
        self.resolved.read().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;

    type Factory = Arc<dyn SerializerFactory>;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn roundtrip<T>(resolver: &SerializerResolver, value: &T) -> T
    where
        T: 'static,
    {
        let serializer = resolver.resolve::<T>().unwrap();
        let mut buf = BytesMut::new();
        serializer.serialize(value, &mut buf).unwrap();
        serializer.deserialize(&buf).unwrap()
    }

    #[test]
    fn test_inbuilt() {
        let resolver = SerializerResolver::new(vec![Arc::new(InbuiltSerializerFactory) as Factory]);

        assert_eq!(roundtrip(&resolver, &"hello".to_owned()), "hello");
        assert_eq!(roundtrip(&resolver, &vec![1u8, 2, 3]), vec![1, 2, 3]);
        assert_eq!(
            roundtrip(&resolver, &Bytes::from_static(b"abc")),
            Bytes::from_static(b"abc")
        );

        assert!(matches!(
            resolver.resolve::<Point>(),
            Err(HybridCacheError::NoSerializer(_))
        ));
    }

    #[test]
    fn test_json() {
        let resolver = SerializerResolver::new(vec![
            Arc::new(InbuiltSerializerFactory) as Factory,
            Arc::new(JsonSerializerFactory::new().with::<Point>()),
        ]);

        let point = Point { x: 1, y: -2 };
        assert_eq!(roundtrip(&resolver, &point), point);

        let serializer = resolver.resolve::<Point>().unwrap();
        let mut buf = BytesMut::new();
        serializer.serialize(&point, &mut buf).unwrap();
        assert_eq!(&buf[..], br#"{"x":1,"y":-2}"#);
        assert!(serializer.deserialize(b"not json").is_err());
    }

    struct ShoutingSerializer;

    impl HybridCacheSerializer<String> for ShoutingSerializer {
        fn serialize(&self, value: &String, target: &mut BytesMut) -> anyhow::Result<()> {
            target.put_slice(value.to_uppercase().as_bytes());
            Ok(())
        }

        fn deserialize(&self, source: &[u8]) -> anyhow::Result<String> {
            Ok(String::from_utf8(source.to_vec())?)
        }
    }

    fn shouting() -> Factory {
        Arc::new(TypedSerializerFactory::<String>::new(Arc::new(
            ShoutingSerializer,
        )))
    }

    #[test]
    fn test_last_registered_wins() {
        let resolver = SerializerResolver::new(vec![
            Arc::new(InbuiltSerializerFactory) as Factory,
            shouting(),
        ]);
        assert_eq!(roundtrip(&resolver, &"hi".to_owned()), "HI");

        let resolver = SerializerResolver::new(vec![
            shouting(),
            Arc::new(InbuiltSerializerFactory) as Factory,
        ]);
        assert_eq!(roundtrip(&resolver, &"hi".to_owned()), "hi");
    }

    #[derive(Debug, Default)]
    struct CountingFactory(AtomicUsize);

    impl SerializerFactory for CountingFactory {
        fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer> {
            self.0.fetch_add(1, Ordering::Relaxed);
            InbuiltSerializerFactory.try_create(type_id)
        }
    }

    #[test]
    fn test_resolution_is_memoized() {
        let factory = Arc::new(CountingFactory::default());
        let resolver = SerializerResolver::new(vec![factory.clone() as Factory]);

        for _ in 0..3 {
            resolver.resolve::<String>().unwrap();
        }
        assert_eq!(factory.0.load(Ordering::Relaxed), 1);
        assert_eq!(resolver.resolved_len(), 1);

        resolver.resolve::<Vec<u8>>().unwrap();
        assert_eq!(factory.0.load(Ordering::Relaxed), 2);
    }
}
