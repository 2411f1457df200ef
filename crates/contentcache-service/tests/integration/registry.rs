use std::sync::Arc;

use bytes::Bytes;

use contentcache_service::caching::BytesDecoder;
use contentcache_service::config::Config;
use contentcache_service::services::{Context, LoadPolicy};
use contentcache_test::{self as helpers, ScriptedFetcher};

fn setup_context(fetcher: &ScriptedFetcher) -> Context<Bytes> {
    Context::from_config(
        &Config::default(),
        Arc::new(BytesDecoder),
        Arc::new(fetcher.clone()),
        LoadPolicy::new(),
        tokio::runtime::Handle::current(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_prior_operation_cancelled_before_next_starts() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    let context = setup_context(&fetcher);
    let owner = context.registry.register_owner();
    let url = "https://example.com/a.png";

    let first = context.registry.associate_with(owner.id(), url, || {
        context
            .loader
            .load(helpers::locator(url), Default::default(), None, |_| {})
    });
    let second = context.registry.associate_with(owner.id(), url, || {
        assert!(first.is_cancelled());
        context
            .loader
            .load(helpers::locator(url), Default::default(), None, |_| {})
    });

    assert!(!second.is_cancelled());
    assert_eq!(context.registry.len(owner.id()), 1);
    let current = context.registry.lookup(owner.id(), url).unwrap();
    assert!(!current.is_cancelled());
}

#[tokio::test]
async fn test_owners_are_independent() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    let context = setup_context(&fetcher);
    let first_owner = context.registry.register_owner();
    let second_owner = context.registry.register_owner();
    let locator = helpers::locator("https://example.com/a.png");

    let first = context.load_for_owner(&first_owner, locator.clone(), Default::default(), None, |_| {});
    let second = context.load_for_owner(&second_owner, locator.clone(), Default::default(), None, |_| {});
    assert!(!first.is_cancelled());
    assert!(!second.is_cancelled());

    context
        .registry
        .cancel_and_remove(first_owner.id(), locator.as_str());
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());

    // idempotent
    context
        .registry
        .cancel_and_remove(first_owner.id(), locator.as_str());
}

#[tokio::test]
async fn test_released_owner() {
    helpers::setup();
    let fetcher = ScriptedFetcher::gated();
    fetcher.serve("https://example.com/a.png", b"image");
    let context = setup_context(&fetcher);
    let owner = context.registry.register_owner();
    let id = owner.id();
    let locator = helpers::locator("https://example.com/a.png");

    let (sender, mut results) = tokio::sync::mpsc::unbounded_channel();
    let operation = context.load_for_owner(&owner, locator.clone(), Default::default(), None, move |result| {
        sender.send(result).ok();
    });
    drop(owner);

    assert!(context.registry.lookup(id, locator.as_str()).is_none());
    // the load is unreachable through the registry, but still completes
    fetcher.release(1);
    assert!(results.recv().await.unwrap().is_ok());
    assert!(!operation.is_cancelled());
}
