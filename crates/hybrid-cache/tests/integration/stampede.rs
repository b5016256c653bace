use std::time::{Duration, Instant};

use hybrid_cache::caching::{EntryFlags, EntryOptions, HybridCache};
use tokio_util::sync::CancellationToken;

use crate::Computations;

const FACTORY_DELAY: Duration = Duration::from_millis(100);

fn spawn_callers(
    cache: &HybridCache,
    computations: &Computations,
    key: &'static str,
    options: Option<EntryOptions>,
    count: usize,
) -> Vec<tokio::task::JoinHandle<String>> {
    (0..count)
        .map(|_| {
            let cache = cache.clone();
            let computations = computations.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                cache
                    .get_or_create(
                        key,
                        computations,
                        move |computations, _| computations.compute(FACTORY_DELAY, key.to_owned()),
                        options.as_ref(),
                        &[],
                        Some(&token),
                    )
                    .await
                    .unwrap()
            })
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_computation_across_threads() {
    hybrid_cache_test::setup();
    let cache = HybridCache::builder().build().unwrap();
    let computations = Computations::default();

    let start = Instant::now();
    let callers = spawn_callers(&cache, &computations, "key", None, 100);
    for value in futures::future::join_all(callers).await {
        assert_eq!(value.unwrap(), "key");
    }

    assert_eq!(computations.get(), 1);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_compute_independently() {
    hybrid_cache_test::setup();
    let cache = HybridCache::builder().build().unwrap();
    let computations = Computations::default();

    let keys = ["a", "b", "c", "d", "e"];
    let callers: Vec<_> = keys
        .iter()
        .flat_map(|key| spawn_callers(&cache, &computations, *key, None, 10))
        .collect();
    let mut values: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    values.dedup();

    assert_eq!(values, keys);
    assert_eq!(computations.get(), keys.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_flags_split_stampedes() {
    hybrid_cache_test::setup();
    let cache = HybridCache::builder().build().unwrap();
    let computations = Computations::default();

    let bypass_local = EntryOptions::default().with_flags(EntryFlags::DISABLE_LOCAL_CACHE_READ);
    let no_local_write = EntryOptions::default().with_flags(EntryFlags::DISABLE_LOCAL_CACHE_WRITE);

    let mut callers = spawn_callers(&cache, &computations, "key", None, 5);
    callers.extend(spawn_callers(&cache, &computations, "key", Some(no_local_write), 5));
    callers.extend(spawn_callers(&cache, &computations, "key", Some(bypass_local), 5));
    for value in futures::future::join_all(callers).await {
        assert_eq!(value.unwrap(), "key");
    }

    // write flags join the default stampede, read flags start their own
    assert_eq!(computations.get(), 2);
}
