use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;

use contentcache_service::caching::{self, BytesDecoder, CacheKey, ContentCache, MemoryTier};
use contentcache_service::config::{Config, DiskCacheConfig, MemoryCacheConfig};
use contentcache_service::types::{CacheType, LoadOptions};
use contentcache_test as helpers;

fn config(cache_dir: &std::path::Path) -> Config {
    let mut config = Config {
        cache_dir: Some(cache_dir.to_owned()),
        ..Default::default()
    };
    config.caches.disk.sweep_interval = None;
    config
}

fn back_date(cache: &ContentCache<Bytes>, key: &CacheKey, age: Duration) {
    let path = cache.disk().unwrap().path_for(key);
    let time = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_times(path, time, time).unwrap();
}

#[tokio::test]
async fn test_round_trip_through_tiers() {
    helpers::setup();
    let cache_dir = helpers::tempdir();
    let cache = ContentCache::from_config(
        &config(cache_dir.path()),
        Arc::new(BytesDecoder),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    let key = CacheKey::new("https://example.com/a.png");
    let payload = Bytes::from_static(b"some image");
    cache
        .store(None, Some(payload.clone()), &key, CacheType::All)
        .await;

    let options = LoadOptions::default();
    let hit = cache.query(&key, &options).await;
    assert_eq!(hit.tier, CacheType::Memory);
    assert_eq!(hit.value.as_deref(), Some(&payload));

    cache.remove(&key, CacheType::Memory).await;
    let hit = cache.query(&key, &options).await;
    assert_eq!(hit.tier, CacheType::Disk);
    assert_eq!(hit.payload.as_ref(), Some(&payload));

    // the disk hit was put back into memory
    assert_eq!(cache.contains(&key, CacheType::All).await, CacheType::Memory);

    cache.remove(&key, CacheType::All).await;
    let miss = cache.query(&key, &options).await;
    assert!(!miss.is_hit());
    assert_eq!(miss.tier, CacheType::None);
}

#[test]
fn test_count_limit_scenario() {
    let memory = MemoryTier::<Bytes>::new(MemoryCacheConfig {
        max_count: 2,
        weak_secondary: false,
        ..Default::default()
    });

    for name in ["a", "b", "c"] {
        let value = Arc::new(Bytes::from(name));
        memory.set(
            CacheKey::new(name),
            caching::MemoryEntry::new(Some(value), None, 1),
        );
    }

    assert_eq!(memory.count(), 2);
    assert!(!memory.contains(&CacheKey::new("a")));
    assert!(memory.contains(&CacheKey::new("b")));
    assert!(memory.contains(&CacheKey::new("c")));
}

#[tokio::test]
async fn test_age_sweep_scenario() {
    helpers::setup();
    let cache_dir = helpers::tempdir();
    let mut config = config(cache_dir.path());
    config.caches.disk = DiskCacheConfig {
        max_age: Some(Duration::from_secs(3600)),
        sweep_interval: None,
        ..Default::default()
    };
    let cache = ContentCache::from_config(
        &config,
        Arc::new(BytesDecoder),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    let old = CacheKey::new("old");
    let fresh = CacheKey::new("fresh");
    for key in [&old, &fresh] {
        cache
            .store(None, Some(Bytes::from_static(b"data")), key, CacheType::Disk)
            .await;
    }
    back_date(&cache, &old, Duration::from_secs(7200));
    back_date(&cache, &fresh, Duration::from_secs(60));

    // a dry run reports, but keeps everything
    let stats = caching::cleanup(&config, true).unwrap();
    assert_eq!(stats.removed_files, 1);
    assert_eq!(cache.contains(&old, CacheType::Disk).await, CacheType::Disk);

    let stats = cache.cleanup().await.unwrap();
    assert_eq!(stats.removed_files, 1);
    assert_eq!(stats.retained_files, 1);
    assert_eq!(cache.contains(&old, CacheType::Disk).await, CacheType::None);
    assert_eq!(cache.contains(&fresh, CacheType::Disk).await, CacheType::Disk);
    assert_eq!(cache.calculate_size().await, (1, 4));
}

#[tokio::test]
async fn test_zero_age_clears_everything() {
    helpers::setup();
    let cache_dir = helpers::tempdir();
    let mut config = config(cache_dir.path());
    config.caches.disk.max_age = Some(Duration::ZERO);
    let cache = ContentCache::from_config(
        &config,
        Arc::new(BytesDecoder),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    let key = CacheKey::new("just written");
    cache
        .store(None, Some(Bytes::from_static(b"data")), &key, CacheType::Disk)
        .await;
    back_date(&cache, &key, Duration::from_secs(1));

    let stats = cache.cleanup().await.unwrap();
    assert_eq!(stats.removed_files, 1);
    assert_eq!(cache.calculate_size().await, (0, 0));
}

#[test]
fn test_cleanup_without_cache_dir() {
    let error = caching::cleanup(&Config::default(), false).unwrap_err();
    assert!(error.to_string().contains("no caching configured"));
}
