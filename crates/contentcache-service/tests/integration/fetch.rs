use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use contentcache_service::config::FetchConfig;
use contentcache_service::download::{FetchError, FetchManager, FetchRequest, ProgressFn};
use contentcache_test::{self as helpers, ScriptedFetcher};

fn manager(fetcher: &ScriptedFetcher, config: FetchConfig) -> FetchManager {
    FetchManager::new(
        config,
        Arc::new(fetcher.clone()),
        tokio::runtime::Handle::current(),
    )
}

#[tokio::test]
async fn test_single_worker_runs_one_fetch_at_a_time() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    fetcher.serve("https://example.com/1", b"one");
    fetcher.serve("https://example.com/2", b"two");
    let config = FetchConfig {
        max_concurrent: 1,
        ..Default::default()
    };
    let manager = manager(&fetcher, config);

    let first = manager.submit(helpers::locator("https://example.com/1"), Default::default());
    let second = manager.submit(helpers::locator("https://example.com/2"), Default::default());

    fetcher.wait_started(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fetcher.started(), ["https://example.com/1"]);
    assert_eq!(manager.stats(), (1, 1));

    fetcher.release(1);
    assert_eq!(first.await.unwrap(), Bytes::from_static(b"one"));

    fetcher.wait_started(2).await;
    fetcher.release(1);
    assert_eq!(second.await.unwrap(), Bytes::from_static(b"two"));
    assert_eq!(manager.stats(), (0, 0));
}

#[tokio::test]
async fn test_cancelled_running_fetch_frees_worker() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    let config = FetchConfig {
        max_concurrent: 1,
        ..Default::default()
    };
    let manager = manager(&fetcher, config);

    let first = manager.submit(helpers::locator("https://example.com/1"), Default::default());
    let second = manager.submit(helpers::locator("https://example.com/2"), Default::default());
    fetcher.wait_started(1).await;

    first.cancel();
    assert_eq!(first.await, Err(FetchError::Cancelled));

    fetcher.wait_started(2).await;
    assert_eq!(fetcher.cancelled(), 1);

    fetcher.release(1);
    assert_eq!(second.await, Err(FetchError::NotFound));
}

#[tokio::test]
async fn test_terminal_failures_block_locator() {
    helpers::setup();
    let fetcher = ScriptedFetcher::new();
    let config = FetchConfig {
        blocklist_threshold: 2,
        ..Default::default()
    };
    let manager = manager(&fetcher, config);
    let locator = helpers::locator("https://example.com/missing.png");

    for _ in 0..2 {
        let result = manager.submit(locator.clone(), Default::default()).await;
        assert_eq!(result, Err(FetchError::NotFound));
    }

    let result = manager.submit(locator.clone(), Default::default()).await;
    assert!(matches!(result, Err(FetchError::Blocked(_))));
    assert_eq!(fetcher.calls("https://example.com/missing.png"), 2);

    manager.remove_failed(&locator);
    let result = manager.submit(locator, Default::default()).await;
    assert_eq!(result, Err(FetchError::NotFound));
    assert_eq!(fetcher.calls("https://example.com/missing.png"), 3);
}

#[tokio::test]
async fn test_transient_failures_do_not_block() {
    helpers::setup();
    let fetcher = ScriptedFetcher::delayed(Duration::from_secs(5));
    let config = FetchConfig {
        timeout: Duration::from_millis(30),
        ..Default::default()
    };
    let manager = manager(&fetcher, config);
    let locator = helpers::locator("https://example.com/slow.png");

    for _ in 0..3 {
        let result = manager.submit(locator.clone(), Default::default()).await;
        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(30))));
    }
    assert!(!manager.is_blocked(&locator));
    assert_eq!(fetcher.cancelled(), 3);
}

#[tokio::test]
async fn test_coalesced_submissions() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    fetcher.serve("https://example.com/a.png", b"image");
    let manager = manager(&fetcher, FetchConfig::default());
    let locator = helpers::locator("https://example.com/a.png");

    let first = manager.submit(locator.clone(), Default::default());
    let second = manager.submit(locator.clone(), Default::default());
    let third = manager.submit(locator.clone(), Default::default());
    fetcher.wait_started(1).await;

    // leaving does not cancel the fetch for the others
    third.cancel();
    assert_eq!(third.await, Err(FetchError::Cancelled));

    fetcher.release(1);
    assert_eq!(first.await.unwrap(), Bytes::from_static(b"image"));
    assert_eq!(second.await.unwrap(), Bytes::from_static(b"image"));
    assert_eq!(fetcher.calls("https://example.com/a.png"), 1);
    assert_eq!(fetcher.cancelled(), 0);

    // a later submission fetches again
    fetcher.release(1);
    manager.submit(locator, Default::default()).await.unwrap();
    assert_eq!(fetcher.calls("https://example.com/a.png"), 2);
}

#[tokio::test]
async fn test_throttled_progress() {
    helpers::setup();
    let fetcher = ScriptedFetcher::chunked(4);
    fetcher.serve("https://example.com/a.png", b"12345678");
    let config = FetchConfig {
        minimum_progress_interval: 0.5,
        ..Default::default()
    };
    let manager = manager(&fetcher, config);

    let fractions = Arc::new(Mutex::new(Vec::new()));
    let progress: ProgressFn = {
        let fractions = fractions.clone();
        Arc::new(move |update| fractions.lock().unwrap().push(update.fraction()))
    };
    let request = FetchRequest {
        progress: Some(progress),
        ..Default::default()
    };

    manager
        .submit(helpers::locator("https://example.com/a.png"), request)
        .await
        .unwrap();
    assert_eq!(*fractions.lock().unwrap(), [Some(0.5), Some(1.0)]);
}
