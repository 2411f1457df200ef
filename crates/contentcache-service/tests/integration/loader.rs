use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use contentcache_service::caching::{BytesDecoder, CacheKey};
use contentcache_service::config::Config;
use contentcache_service::download::FetchError;
use contentcache_service::services::{
    CombinedOperation, Context, LoadPolicy, LoadResult, LoadState,
};
use contentcache_service::types::{CacheType, LoadOptions, Locator};
use contentcache_test::{self as helpers, ScriptedFetcher, TempDir};

fn setup_context(fetcher: &ScriptedFetcher, policy: LoadPolicy<Bytes>) -> (Context<Bytes>, TempDir) {
    let cache_dir = helpers::tempdir();
    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    config.caches.disk.sweep_interval = None;
    let context = Context::from_config(
        &config,
        Arc::new(BytesDecoder),
        Arc::new(fetcher.clone()),
        policy,
        tokio::runtime::Handle::current(),
    )
    .unwrap();
    (context, cache_dir)
}

fn load(
    context: &Context<Bytes>,
    url: &str,
    options: LoadOptions,
) -> (CombinedOperation<Bytes>, mpsc::UnboundedReceiver<LoadResult<Bytes>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let operation = context
        .loader
        .load(helpers::locator(url), options, None, move |result| {
            sender.send(result).ok();
        });
    (operation, receiver)
}

async fn wait_for_state(operation: &CombinedOperation<Bytes>, state: LoadState) {
    for _ in 0..200 {
        if operation.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("operation never reached {state:?}");
}

#[tokio::test]
async fn test_miss_fetch_store_hit() {
    helpers::setup();
    let fetcher = ScriptedFetcher::new();
    fetcher.serve("https://example.com/a.png", b"image");
    let (context, _cache_dir) = setup_context(&fetcher, LoadPolicy::new());

    let (operation, mut results) = load(&context, "https://example.com/a.png", Default::default());
    let loaded = results.recv().await.unwrap().unwrap();
    assert_eq!(*loaded.value, Bytes::from_static(b"image"));
    assert_eq!(loaded.tier, CacheType::None);
    assert_eq!(operation.state(), LoadState::Done);

    let key = context.loader.cache_key_for(&helpers::locator("https://example.com/a.png"));
    assert_eq!(context.cache.contains(&key, CacheType::Disk).await, CacheType::Disk);

    // served from memory, then from disk
    let (_operation, mut results) = load(&context, "https://example.com/a.png", Default::default());
    assert_eq!(results.recv().await.unwrap().unwrap().tier, CacheType::Memory);

    drop(loaded);
    context.cache.handle_memory_pressure();
    let (_operation, mut results) = load(&context, "https://example.com/a.png", Default::default());
    assert_eq!(results.recv().await.unwrap().unwrap().tier, CacheType::Disk);

    assert_eq!(fetcher.total_calls(), 1);
}

#[tokio::test]
async fn test_failed_load_keeps_locator() {
    helpers::setup();
    let fetcher = ScriptedFetcher::new();
    let (context, _cache_dir) = setup_context(&fetcher, LoadPolicy::new());

    let (_operation, mut results) = load(&context, "https://example.com/missing.png", Default::default());
    let error = results.recv().await.unwrap().unwrap_err();
    assert_eq!(error.error, FetchError::NotFound);
    assert_eq!(error.locator.as_str(), "https://example.com/missing.png");
}

#[tokio::test]
async fn test_cancel_while_fetching() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    fetcher.serve("https://example.com/a.png", b"image");
    let (context, _cache_dir) = setup_context(&fetcher, LoadPolicy::new());

    let (operation, mut results) = load(&context, "https://example.com/a.png", Default::default());
    fetcher.wait_started(1).await;
    assert_eq!(operation.state(), LoadState::Fetching);

    operation.cancel();
    fetcher.release(1);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(fetcher.cancelled(), 1);
    assert!(results.recv().await.is_none());
    assert_eq!(operation.state(), LoadState::Cancelled);

    let key = operation.key().clone();
    assert_eq!(context.cache.contains(&key, CacheType::All).await, CacheType::None);
}

#[tokio::test]
async fn test_cancel_one_of_two_loads() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    fetcher.serve("https://example.com/a.png", b"image");
    let (context, _cache_dir) = setup_context(&fetcher, LoadPolicy::new());

    let (first, mut first_results) = load(&context, "https://example.com/a.png", Default::default());
    let (second, mut second_results) =
        load(&context, "https://example.com/a.png", Default::default());
    fetcher.wait_started(1).await;
    wait_for_state(&first, LoadState::Fetching).await;
    wait_for_state(&second, LoadState::Fetching).await;
    // both loads are attached to the fetch
    tokio::time::sleep(Duration::from_millis(10)).await;

    first.cancel();
    fetcher.release(1);

    assert!(second_results.recv().await.unwrap().is_ok());
    assert!(first_results.recv().await.is_none());
    assert_eq!(fetcher.total_calls(), 1);
    assert_eq!(fetcher.cancelled(), 0);
}

#[tokio::test]
async fn test_serializer_and_key_filter() {
    helpers::setup();
    let fetcher = ScriptedFetcher::new();
    fetcher.serve("https://example.com/a.png?token=1", b"image");
    fetcher.serve("https://example.com/b.png", b"private");
    let policy = LoadPolicy::new()
        .with_key_filter(|locator: &Locator| {
            let mut locator = locator.clone();
            locator.set_query(None);
            locator.to_string()
        })
        .with_serializer(|value: &Bytes, _: Option<&Bytes>, locator: &Locator| {
            (!locator.path().starts_with("/b")).then(|| value.clone())
        });
    let (context, _cache_dir) = setup_context(&fetcher, policy);

    let (operation, mut results) =
        load(&context, "https://example.com/a.png?token=1", Default::default());
    results.recv().await.unwrap().unwrap();
    assert_eq!(operation.key(), &CacheKey::new("https://example.com/a.png"));
    assert_eq!(context.cache.contains(operation.key(), CacheType::Disk).await, CacheType::Disk);

    // the serializer keeps this one out of the disk tier
    let (operation, mut results) = load(&context, "https://example.com/b.png", Default::default());
    results.recv().await.unwrap().unwrap();
    assert_eq!(
        context.cache.contains(operation.key(), CacheType::All).await,
        CacheType::Memory
    );
    assert_eq!(context.cache.contains(operation.key(), CacheType::Disk).await, CacheType::None);
}

#[tokio::test]
async fn test_options_processor() {
    helpers::setup();
    let fetcher = ScriptedFetcher::new();
    fetcher.serve("https://example.com/a.png", b"image");
    let policy = LoadPolicy::new().with_options_processor(|_, mut options: LoadOptions| {
        options.store_tier = CacheType::Disk;
        options
    });
    let (context, _cache_dir) = setup_context(&fetcher, policy);

    let (operation, mut results) = load(&context, "https://example.com/a.png", Default::default());
    results.recv().await.unwrap().unwrap();
    assert_eq!(
        context.cache.contains(operation.key(), CacheType::All).await,
        CacheType::Disk
    );
}

#[tokio::test]
async fn test_retry_failed() {
    helpers::setup();
    let fetcher = ScriptedFetcher::new();
    let (context, _cache_dir) = setup_context(&fetcher, LoadPolicy::new());

    let (_operation, mut results) = load(&context, "https://example.com/a.png", Default::default());
    assert_eq!(results.recv().await.unwrap().unwrap_err().error, FetchError::NotFound);

    let (_operation, mut results) = load(&context, "https://example.com/a.png", Default::default());
    assert!(matches!(
        results.recv().await.unwrap().unwrap_err().error,
        FetchError::Blocked(_)
    ));

    fetcher.serve("https://example.com/a.png", b"image");
    let options = LoadOptions {
        retry_failed: true,
        ..Default::default()
    };
    let (_operation, mut results) = load(&context, "https://example.com/a.png", options);
    assert!(results.recv().await.unwrap().is_ok());
    assert!(!context.fetcher.is_blocked(&helpers::locator("https://example.com/a.png")));
    assert_eq!(fetcher.total_calls(), 2);
}
