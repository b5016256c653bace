use std::time::Duration;

use hybrid_cache::caching::{EntryOptions, HybridCacheError};

use crate::{Computations, filesystem_cache};

#[tokio::test]
async fn test_shared_between_instances() {
    hybrid_cache_test::setup();
    let cache_dir = hybrid_cache_test::tempdir();
    let computations = Computations::default();

    let first = filesystem_cache(cache_dir.path());
    let value = first
        .get_or_create(
            "languages",
            computations.clone(),
            |computations, _| {
                computations.compute(Duration::ZERO, vec!["rust".to_owned(), "c".to_owned()])
            },
            None,
            &[],
            None,
        )
        .await
        .unwrap();
    assert_eq!(value, ["rust", "c"]);

    let second = filesystem_cache(cache_dir.path());
    let value: Vec<String> = second
        .get_or_create(
            "languages",
            computations.clone(),
            |computations, _| computations.compute(Duration::ZERO, vec![]),
            None,
            &[],
            None,
        )
        .await
        .unwrap();
    assert_eq!(value, ["rust", "c"]);
    assert_eq!(computations.get(), 1);
}

#[tokio::test]
async fn test_remove_key_affects_all_instances() {
    hybrid_cache_test::setup();
    let cache_dir = hybrid_cache_test::tempdir();

    let first = filesystem_cache(cache_dir.path());
    first
        .set("greeting", "hello".to_owned(), None, &[], None)
        .await
        .unwrap();
    first.remove_key("greeting", None).await.unwrap();

    let second = filesystem_cache(cache_dir.path());
    let options = EntryOptions::default()
        .with_flags(hybrid_cache::caching::EntryFlags::DISABLE_UNDERLYING_DATA);
    let result = second
        .get_or_create(
            "greeting",
            (),
            |_, _| async { Ok(String::new()) },
            Some(&options),
            &[],
            None,
        )
        .await;
    assert!(matches!(result, Err(HybridCacheError::NotFound)));
}

#[tokio::test]
async fn test_expired_entries_are_recomputed() {
    hybrid_cache_test::setup();
    let cache_dir = hybrid_cache_test::tempdir();
    let computations = Computations::default();
    let options = EntryOptions::default().with_expiration(Duration::from_millis(50));

    let first = filesystem_cache(cache_dir.path());
    first
        .set("short-lived", "soon gone".to_owned(), Some(&options), &[], None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = filesystem_cache(cache_dir.path());
    let value = second
        .get_or_create(
            "short-lived",
            computations.clone(),
            |computations, _| computations.compute(Duration::ZERO, "fresh".to_owned()),
            None,
            &[],
            None,
        )
        .await
        .unwrap();
    assert_eq!(value, "fresh");
    assert_eq!(computations.get(), 1);
}

#[tokio::test]
async fn test_unserializable_payload_is_rejected() {
    hybrid_cache_test::setup();
    let cache_dir = hybrid_cache_test::tempdir();
    let cache = filesystem_cache(cache_dir.path());

    let result = cache.set("number", 42u32, None, &[], None).await;
    assert!(matches!(result, Err(HybridCacheError::NoSerializer(_))));
}
