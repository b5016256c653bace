use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hybrid_cache::caching::{CacheResult, HybridCache};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

/// What a single operation of a workload does.
///
/// All workloads share the same key space, `stress:0` up to `stress:{keys - 1}`, so that e.g.
/// removals interfere with concurrent reads.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Reads a key, computing `payload_bytes` bytes in `factory_delay` on a miss.
    GetOrCreate {
        keys: usize,
        #[serde(with = "humantime_serde", default)]
        factory_delay: Duration,
        payload_bytes: usize,
    },
    /// Overwrites a key with `payload_bytes` bytes.
    Set { keys: usize, payload_bytes: usize },
    /// Removes a key.
    Remove { keys: usize },
}

impl Payload {
    fn keys(&self) -> usize {
        let keys = match self {
            Payload::GetOrCreate { keys, .. } => keys,
            Payload::Set { keys, .. } => keys,
            Payload::Remove { keys } => keys,
        };
        (*keys).max(1)
    }
}

/// Picks the key for the `iteration`th operation, spreading consecutive operations apart.
fn key_for(payload: &Payload, iteration: usize) -> String {
    let index = iteration.wrapping_mul(7919) % payload.keys();
    format!("stress:{index}")
}

/// Runs the `iteration`th operation of a workload, counting factory invocations in `computations`.
pub async fn process_payload(
    cache: &HybridCache,
    payload: &Payload,
    iteration: usize,
    computations: &Arc<AtomicUsize>,
) -> CacheResult<()> {
    let key = key_for(payload, iteration);
    // operations are never cancelled, but go through the cancellable code path
    let token = CancellationToken::new();

    match *payload {
        Payload::GetOrCreate {
            factory_delay,
            payload_bytes,
            ..
        } => {
            let value: Vec<u8> = cache
                .get_or_create(
                    &key,
                    Arc::clone(computations),
                    move |computations, _| async move {
                        computations.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(factory_delay).await;
                        Ok(vec![0xAB; payload_bytes])
                    },
                    None,
                    &[],
                    Some(&token),
                )
                .await?;
            std::hint::black_box(value);
        }
        Payload::Set { payload_bytes, .. } => {
            cache
                .set(&key, vec![0xCD_u8; payload_bytes], None, &[], Some(&token))
                .await?;
        }
        Payload::Remove { .. } => {
            cache.remove_key(&key, Some(&token)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 100
                get_or_create:
                  keys: 1000
                  factory_delay: 5ms
                  payload_bytes: 1024
              - concurrency: 2
                remove:
                  keys: 1000
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.workloads.len(), 2);
        assert_eq!(config.workloads[0].concurrency, 100);
        assert!(matches!(
            config.workloads[0].payload,
            Payload::GetOrCreate {
                keys: 1000,
                payload_bytes: 1024,
                ..
            }
        ));
        assert!(matches!(
            config.workloads[1].payload,
            Payload::Remove { keys: 1000 }
        ));
    }

    #[test]
    fn test_keys_stay_in_range() {
        let payload = Payload::Remove { keys: 10 };
        for iteration in 0..100 {
            let key = key_for(&payload, iteration);
            let index: usize = key.strip_prefix("stress:").unwrap().parse().unwrap();
            assert!(index < 10);
        }
    }

    #[tokio::test]
    async fn test_process_payloads() {
        let cache = HybridCache::builder().build().unwrap();
        let workloads = [
            Payload::GetOrCreate {
                keys: 4,
                factory_delay: Duration::ZERO,
                payload_bytes: 16,
            },
            Payload::Set {
                keys: 4,
                payload_bytes: 16,
            },
            Payload::Remove { keys: 4 },
        ];

        let computations = Arc::default();
        for (iteration, payload) in workloads.iter().enumerate() {
            process_payload(&cache, payload, iteration, &computations)
                .await
                .unwrap();
        }
        assert_eq!(computations.load(Ordering::Relaxed), 1);
    }
}
