//! End-to-end behavior of `CacheManager` against in-memory and file storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swr_cache::{
    CacheConfig, CacheError, CacheManager, CacheStatus, FetchError, FileStorage, ManualClock,
    MemoryStorage, Storage, TtlPolicy,
};

const FRESH: Duration = Duration::from_millis(100);
const STALE: Duration = Duration::from_millis(1_000);

type TestCache = CacheManager<Arc<MemoryStorage>, Arc<ManualClock>>;

/// Route cache logs to the test harness. Set `RUST_LOG=swr_cache=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> (TestCache, Arc<MemoryStorage>, Arc<ManualClock>) {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new());
    let cache = CacheManager::with_clock(Arc::clone(&storage), Arc::clone(&clock));
    (cache, storage, clock)
}

/// A fetch function that counts its invocations.
fn counting_fetch(
    calls: &Arc<AtomicUsize>,
    value: &'static str,
) -> impl FnOnce() -> std::future::Ready<Result<String, FetchError>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(value.to_string()))
    }
}

/// Wait until no fetch is outstanding for `key`.
async fn settle<S: Storage>(cache: &CacheManager<S, Arc<ManualClock>>, key: &str) {
    for _ in 0..500 {
        if !cache.is_in_flight(key) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("fetch for {key} never settled");
}

#[tokio::test]
async fn test_fresh_read_after_set() {
    let (cache, _, _) = setup();
    cache.set("k", "v", FRESH).await;
    assert_eq!(cache.get::<String>("k", FRESH).await.as_deref(), Some("v"));
}

#[tokio::test]
async fn test_stale_while_revalidate_scenario() {
    let (cache, _, clock) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.set("k", "v1", FRESH).await;

    clock.advance(Duration::from_millis(50));
    let fetched = cache
        .get_or_fetch("k", counting_fetch(&calls, "unused"), FRESH, STALE)
        .await
        .unwrap();
    assert_eq!(fetched.value, "v1");
    assert!(fetched.from_cache);
    assert_eq!(fetched.status, CacheStatus::Hit);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_millis(450));
    let fetched = cache
        .get_or_fetch("k", counting_fetch(&calls, "v2"), FRESH, STALE)
        .await
        .unwrap();
    assert_eq!(fetched.value, "v1");
    assert!(fetched.from_cache);
    assert_eq!(fetched.status, CacheStatus::Stale);

    settle(&cache, "k").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_millis(10));
    assert_eq!(cache.get::<String>("k", FRESH).await.as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_expired_entry_fetches_synchronously() {
    let (cache, _, clock) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.set("k", "old", FRESH).await;
    clock.advance(STALE + Duration::from_millis(1));

    assert_eq!(cache.get::<String>("k", STALE).await, None);

    let fetched = cache
        .get_or_fetch("k", counting_fetch(&calls, "new"), FRESH, STALE)
        .await
        .unwrap();
    assert_eq!(fetched.value, "new");
    assert!(!fetched.from_cache);
    assert_eq!(fetched.status, CacheStatus::Miss);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(cache.get::<String>("k", FRESH).await.as_deref(), Some("new"));
}

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let (cache, _, _) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..16).map(|_| {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        async move {
            cache
                .get_or_fetch(
                    "report",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, FetchError>(vec![1u32, 2, 3])
                    },
                    FRESH,
                    STALE,
                )
                .await
        }
    });

    let results = futures::future::join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let mut misses = 0;
    for result in results {
        let fetched = result.unwrap();
        assert_eq!(fetched.value, vec![1, 2, 3]);
        assert!(!fetched.from_cache);
        if fetched.status == CacheStatus::Miss {
            misses += 1;
        }
    }
    assert_eq!(misses, 1);
    assert_eq!(cache.stats().joined, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_fetch_once_across_threads() {
    let (cache, _, _) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(
                        "report",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, FetchError>("shared".to_string())
                        },
                        FRESH,
                        STALE,
                    )
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().value, "shared");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_joined_callers_share_fetch_error() {
    let (cache, _, _) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..4).map(|_| {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        async move {
            cache
                .get_or_fetch::<String, _, _>(
                    "k",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(FetchError::msg("service unavailable"))
                    },
                    FRESH,
                    STALE,
                )
                .await
        }
    });

    for result in futures::future::join_all(callers).await {
        match result {
            Err(CacheError::Fetch(e)) => assert_eq!(e.to_string(), "service unavailable"),
            other => panic!("expected fetch error, got {other:?}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.is_in_flight("k"));
}

#[tokio::test]
async fn test_stale_read_does_not_wait_for_fetch() {
    let (cache, _, clock) = setup();
    cache.set("k", "stale", FRESH).await;
    clock.advance(Duration::from_millis(500));

    let fetched = tokio::time::timeout(
        Duration::from_millis(100),
        cache.get_or_fetch(
            "k",
            || std::future::pending::<Result<String, FetchError>>(),
            FRESH,
            STALE,
        ),
    )
    .await
    .expect("stale read blocked on the fetch")
    .unwrap();

    assert_eq!(fetched.value, "stale");
    assert!(fetched.from_cache);
    assert!(cache.is_in_flight("k"));
}

#[tokio::test]
async fn test_stale_reads_start_one_revalidation() {
    let (cache, _, clock) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.set("k", "v1", FRESH).await;
    clock.advance(Duration::from_millis(500));

    for _ in 0..5 {
        let calls = Arc::clone(&calls);
        let fetched = cache
            .get_or_fetch(
                "k",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, FetchError>("v2".to_string())
                },
                FRESH,
                STALE,
            )
            .await
            .unwrap();
        assert_eq!(fetched.value, "v1");
    }

    settle(&cache, "k").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().revalidations, 1);
    assert_eq!(cache.stats().stale_hits, 5);
}

#[tokio::test]
async fn test_failed_revalidation_keeps_stale_entry() {
    let (cache, _, clock) = setup();
    cache.set("k", "v1", FRESH).await;
    clock.advance(Duration::from_millis(500));

    let fetched = cache
        .get_or_fetch::<String, _, _>(
            "k",
            || async { Err(FetchError::msg("timeout")) },
            FRESH,
            STALE,
        )
        .await
        .unwrap();
    assert_eq!(fetched.value, "v1");

    settle(&cache, "k").await;
    assert_eq!(cache.get::<String>("k", STALE).await.as_deref(), Some("v1"));
    assert_eq!(cache.stats().revalidation_failures, 1);
}

#[tokio::test]
async fn test_expired_caller_joins_background_revalidation() {
    let (cache, _, clock) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.set("k", "v1", FRESH).await;
    clock.advance(Duration::from_millis(500));

    let background_calls = Arc::clone(&calls);
    cache
        .get_or_fetch(
            "k",
            move || async move {
                background_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, FetchError>("v2".to_string())
            },
            FRESH,
            STALE,
        )
        .await
        .unwrap();

    // A stricter caller treats the same entry as expired and waits for the
    // background fetch instead of issuing its own.
    let fetched = cache
        .get_or_fetch(
            "k",
            counting_fetch(&calls, "v3"),
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

    assert_eq!(fetched.value, "v2");
    assert_eq!(fetched.status, CacheStatus::Joined);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalidate_pattern() {
    let (cache, _, _) = setup();
    cache.set("user_1", "alice", FRESH).await;
    cache.set("user_2", "bob", FRESH).await;
    cache.set("order_1", &99u32, FRESH).await;

    assert_eq!(cache.invalidate_pattern("user_*").await, 2);

    assert_eq!(cache.get::<String>("user_1", FRESH).await, None);
    assert_eq!(cache.get::<String>("user_2", FRESH).await, None);
    assert_eq!(cache.get::<u32>("order_1", FRESH).await, Some(99));

    assert_eq!(cache.invalidate_pattern("nothing_*").await, 0);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let (cache, _, _) = setup();
    cache.set("k", "v", FRESH).await;

    cache.remove("k").await;
    cache.remove("k").await;
    cache.remove("never-set").await;

    assert_eq!(cache.get::<String>("k", FRESH).await, None);
}

#[tokio::test]
async fn test_corrupt_entry_is_a_miss_and_removed() {
    let (cache, storage, _) = setup();
    storage.write("k", b"{not json".to_vec()).await.unwrap();

    assert_eq!(cache.get::<String>("k", FRESH).await, None);
    assert_eq!(storage.read("k").await.unwrap(), None);
    assert_eq!(cache.stats().corrupt_entries, 1);
}

#[tokio::test]
async fn test_corrupt_entry_refetched_by_get_or_fetch() {
    let (cache, storage, _) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    storage.write("k", vec![0xff, 0x00]).await.unwrap();

    let fetched = cache
        .get_or_fetch("k", counting_fetch(&calls, "repaired"), FRESH, STALE)
        .await
        .unwrap();

    assert_eq!(fetched.value, "repaired");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_clear_expired() {
    let (cache, storage, clock) = setup();
    cache.set("old", "a", FRESH).await;
    clock.advance(Duration::from_secs(10));
    cache.set("new", "b", FRESH).await;
    storage.write("broken", b"garbage".to_vec()).await.unwrap();

    clock.advance(Duration::from_secs(1));
    let removed = cache.clear_expired(Duration::from_secs(5)).await;

    assert_eq!(removed, 2);
    let keys = cache.keys().await;
    assert_eq!(keys, vec!["new".to_string()]);
}

#[tokio::test]
async fn test_clear_expired_keeps_entry_at_exact_hard_ttl() {
    let (cache, _, clock) = setup();
    cache.set("k", "v", FRESH).await;

    clock.advance(Duration::from_secs(5));
    assert_eq!(cache.clear_expired(Duration::from_secs(5)).await, 0);
    assert_eq!(cache.keys().await, vec!["k".to_string()]);

    clock.advance(Duration::from_millis(1));
    assert_eq!(cache.clear_expired(Duration::from_secs(5)).await, 1);
    assert!(cache.keys().await.is_empty());
}

#[tokio::test]
async fn test_ttl_is_a_read_time_concern() {
    let (cache, _, clock) = setup();
    cache.set("k", "v", Duration::from_secs(1)).await;
    clock.advance(Duration::from_millis(300));

    assert_eq!(cache.get::<String>("k", Duration::from_secs(1)).await.as_deref(), Some("v"));

    let calls = Arc::new(AtomicUsize::new(0));
    let fetched = cache
        .get_or_fetch(
            "k",
            counting_fetch(&calls, "v2"),
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(fetched.status, CacheStatus::Stale);
    settle(&cache, "k").await;
}

#[tokio::test]
async fn test_get_or_fetch_default_uses_config() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new());
    let config = CacheConfig::default().with_ttl(TtlPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(2),
    ));
    let cache = CacheManager::with_config(storage, Arc::clone(&clock), config);

    cache.set("k", "v", Duration::from_secs(1)).await;
    clock.advance(Duration::from_millis(2_500));

    let calls = Arc::new(AtomicUsize::new(0));
    let fetched = cache
        .get_or_fetch_default("k", counting_fetch(&calls, "fresh"))
        .await
        .unwrap();
    assert_eq!(fetched.value, "fresh");
    assert_eq!(fetched.status, CacheStatus::Miss);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_removes_old_entries() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new());
    let config = CacheConfig::default()
        .with_hard_ttl(Duration::from_secs(60))
        .with_sweep_interval(Duration::from_secs(10));
    let cache = CacheManager::with_config(Arc::clone(&storage), Arc::clone(&clock), config);

    cache.set("k", "v", FRESH).await;
    clock.advance(Duration::from_secs(61));

    let sweeper = cache.spawn_sweeper();
    tokio::time::sleep(Duration::from_secs(25)).await;
    tokio::task::yield_now().await;

    assert!(storage.is_empty());
    sweeper.abort();
}

#[tokio::test]
async fn test_file_storage_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path().join("cache")).await.unwrap();
    let clock = Arc::new(ManualClock::new());
    let cache = CacheManager::with_clock(storage, Arc::clone(&clock));
    let calls = Arc::new(AtomicUsize::new(0));

    let first = cache
        .get_or_fetch("issues_filtered_7", counting_fetch(&calls, "list"), FRESH, STALE)
        .await
        .unwrap();
    let second = cache
        .get_or_fetch("issues_filtered_7", counting_fetch(&calls, "list"), FRESH, STALE)
        .await
        .unwrap();

    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(cache.invalidate_pattern("issues_*").await, 1);
    assert!(cache.keys().await.is_empty());
}
