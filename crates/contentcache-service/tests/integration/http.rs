use std::sync::{Arc, Mutex};

use bytes::Bytes;

use contentcache_service::caching::BytesDecoder;
use contentcache_service::config::{Config, FetchConfig};
use contentcache_service::download::{
    FetchError, Fetcher, HttpFetcher, Progress, SchemeFetcher,
};
use contentcache_service::services::{Context, LoadPolicy};
use contentcache_service::types::CacheType;
use contentcache_test::{self as helpers, HitCounter};

fn fetcher() -> HttpFetcher {
    HttpFetcher::from_config(&FetchConfig::default()).unwrap()
}

#[tokio::test]
async fn test_fetch_body() {
    helpers::setup();
    let server = HitCounter::new();

    let result = fetcher()
        .fetch(&server.url("garbage_data/hello"), Progress::noop())
        .await;
    assert_eq!(result.unwrap(), Bytes::from_static(b"hello"));

    // redirects are followed
    let result = fetcher()
        .fetch(&server.url("redirect/garbage_data/world"), Progress::noop())
        .await;
    assert_eq!(result.unwrap(), Bytes::from_static(b"world"));

    assert_eq!(
        server.all_hits(),
        [
            ("/garbage_data/hello".to_owned(), 1),
            ("/garbage_data/world".to_owned(), 1),
            ("/redirect/garbage_data/world".to_owned(), 1),
        ]
    );
}

#[tokio::test]
async fn test_status_codes() {
    helpers::setup();
    let server = HitCounter::new();
    let fetcher = fetcher();

    let fetch = |status: u16| {
        let locator = server.url(&format!("respond_statuscode/{status}/a.png"));
        let fetcher = fetcher.clone();
        async move { fetcher.fetch(&locator, Progress::noop()).await }
    };

    assert_eq!(fetch(404).await, Err(FetchError::NotFound));
    assert_eq!(fetch(410).await, Err(FetchError::NotFound));
    assert_eq!(
        fetch(403).await,
        Err(FetchError::PermissionDenied("403 Forbidden".into()))
    );
    assert_eq!(
        fetch(500).await,
        Err(FetchError::Transport("500 Internal Server Error".into()))
    );
    assert_eq!(server.accesses(), 4);
}

#[tokio::test]
async fn test_progress() {
    helpers::setup();
    let server = HitCounter::new();

    let reports = Arc::new(Mutex::new(Vec::new()));
    let progress = {
        let reports = reports.clone();
        Progress::from_fn(move |received, expected| {
            reports.lock().unwrap().push((received, expected))
        })
    };

    let body = fetcher()
        .fetch(&server.url("bytes/10000/a.png"), progress)
        .await
        .unwrap();
    assert_eq!(body.len(), 10000);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.first(), Some(&(0, Some(10000))));
    assert_eq!(reports.last(), Some(&(10000, Some(10000))));
    assert!(reports.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[tokio::test]
async fn test_unsupported_scheme() {
    helpers::setup();
    let fetcher = SchemeFetcher::from_config(&FetchConfig::default()).unwrap();

    let result = fetcher
        .fetch(&helpers::locator("ftp://example.com/a.png"), Progress::noop())
        .await;
    insta::assert_snapshot!(result.unwrap_err(), @"invalid locator: unsupported scheme `ftp`");
}

#[tokio::test]
async fn test_load_over_http() {
    helpers::setup();
    let server = HitCounter::new();
    let cache_dir = helpers::tempdir();
    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    config.caches.disk.sweep_interval = None;
    let fetcher = SchemeFetcher::from_config(&config.fetch).unwrap();
    let context = Context::from_config(
        &config,
        Arc::new(BytesDecoder),
        Arc::new(fetcher),
        LoadPolicy::new(),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    let locator = server.url("garbage_data/image.png");
    for expected_tier in [CacheType::None, CacheType::Memory] {
        let (sender, mut results) = tokio::sync::mpsc::unbounded_channel();
        context
            .loader
            .load(locator.clone(), Default::default(), None, move |result| {
                sender.send(result).ok();
            });
        let loaded = results.recv().await.unwrap().unwrap();
        assert_eq!(*loaded.value, Bytes::from_static(b"image.png"));
        assert_eq!(loaded.tier, expected_tier);
    }

    assert_eq!(server.accesses(), 1);
}
