use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{DEFAULT_LOCAL_CACHE_CAPACITY, DistributedCacheConfig, HybridCacheOptions};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "hybrid_cache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the local in-memory cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// The maximum size of the cache, in bytes.
    pub capacity: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOCAL_CACHE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    pub sentry_dsn: Option<Dsn>,

    /// Defaults and limits for cache entries.
    pub cache: HybridCacheOptions,

    /// The local in-memory cache.
    pub local_cache: LocalCacheConfig,

    /// The distributed cache. No distributed cache is used if this is absent.
    ///
    /// Written either as a bare backend name (`memory`) or as a map with the backend name
    /// as its single key (`filesystem: { path: ... }`).
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub distributed: Option<DistributedCacheConfig>,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::caching::{
        DEFAULT_MAXIMUM_PAYLOAD_BYTES, EntryFlags, FilesystemDistributedCacheConfig,
    };

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "hybrid_cache");
        assert_eq!(cfg.cache, HybridCacheOptions::default());
        assert_eq!(cfg.local_cache.capacity, DEFAULT_LOCAL_CACHE_CAPACITY);
        assert!(cfg.distributed.is_none());
    }

    #[test]
    fn test_empty_file() {
        let err = Config::from_reader("   \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }

    #[test]
    fn test_cache_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            cache:
              default_entry_options:
                expiration: 10m
                local_cache_expiration: 30s
                flags: DISABLE_LOCAL_CACHE_WRITE | disable_distributed_cache_read
              maximum_key_length: 128
            local_cache:
              capacity: 1048576
            distributed:
              filesystem:
                path: /tmp/hybrid-cache
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let defaults = cfg.cache.default_entry_options;
        assert_eq!(defaults.expiration, Some(Duration::from_secs(600)));
        assert_eq!(defaults.local_cache_expiration, Some(Duration::from_secs(30)));
        assert_eq!(
            defaults.flags,
            Some(EntryFlags::DISABLE_LOCAL_CACHE_WRITE | EntryFlags::DISABLE_DISTRIBUTED_CACHE_READ)
        );
        assert_eq!(cfg.cache.maximum_key_length, 128);
        assert_eq!(
            cfg.cache.maximum_payload_bytes,
            DEFAULT_MAXIMUM_PAYLOAD_BYTES
        );

        assert_eq!(cfg.local_cache.capacity, 1024 * 1024);
        assert_eq!(
            cfg.distributed,
            Some(DistributedCacheConfig::Filesystem(
                FilesystemDistributedCacheConfig {
                    path: PathBuf::from("/tmp/hybrid-cache"),
                }
            ))
        );
    }

    #[test]
    fn test_memory_backend() {
        let cfg = Config::from_reader("distributed: memory".as_bytes()).unwrap();
        assert_eq!(cfg.distributed, Some(DistributedCacheConfig::Memory));
    }

    #[test]
    fn test_filesystem_backend_forms() {
        let expected = Some(DistributedCacheConfig::Filesystem(
            FilesystemDistributedCacheConfig {
                path: PathBuf::from("/tmp/x"),
            },
        ));

        let cfg = Config::from_reader("distributed:\n  filesystem:\n    path: /tmp/x".as_bytes())
            .unwrap();
        assert_eq!(cfg.distributed, expected);

        let cfg = Config::from_reader("distributed: { filesystem: { path: /tmp/x } }".as_bytes())
            .unwrap();
        assert_eq!(cfg.distributed, expected);

        assert!(Config::from_reader("distributed:\n  redis:\n    url: x".as_bytes()).is_err());
        assert!(Config::from_reader("distributed:\n  filesystem: {}".as_bytes()).is_err());
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::from_reader("logging:\n  level: loud".as_bytes()).is_err());
        assert!(
            Config::from_reader("cache:\n  default_entry_options:\n    flags: NOPE".as_bytes())
                .is_err()
        );
    }
}
