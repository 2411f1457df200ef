use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sentry::SentryFutureExt;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, ContentCache};
use crate::download::{
    FetchCanceller, FetchError, FetchManager, FetchProgress, FetchRequest, LoadError, ProgressFn,
};
use crate::types::{CacheType, Locator, LoadOptions};
use crate::utils::futures::CallOnDrop;

use super::policy::{LoadPolicy, Persist};
use super::registry::Operation;

/// A successfully loaded value.
#[derive(Debug)]
pub struct Loaded<T> {
    pub value: Arc<T>,
    /// The bytes the value was decoded from, if they are at hand.
    pub payload: Option<Bytes>,
    /// The tier the value came from, or [`CacheType::None`] if it was just fetched.
    pub tier: CacheType,
    pub locator: Locator,
    /// `false` for a cached value that is followed by a fresh one.
    pub finished: bool,
}

impl<T> Clone for Loaded<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            payload: self.payload.clone(),
            tier: self.tier,
            locator: self.locator.clone(),
            finished: self.finished,
        }
    }
}

/// What a load completion receives.
pub type LoadResult<T> = Result<Loaded<T>, LoadError>;

type Completion<T> = Box<dyn FnMut(LoadResult<T>) + Send>;

/// The states a [`CombinedOperation`] moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    CacheQuerying,
    Fetching,
    Storing,
    Done,
    Cancelled,
}

impl LoadState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

struct OperationState<T> {
    state: LoadState,
    fetch: Option<FetchCanceller>,
    completion: Option<Completion<T>>,
    /// Set when a cancellation must be reported while the completion is out for delivery.
    ack_pending: bool,
}

struct OperationInner<T> {
    id: u64,
    locator: Locator,
    key: CacheKey,
    report_cancellation: bool,
    token: CancellationToken,
    state: Mutex<OperationState<T>>,
}

/// The handle of one load, covering both the cache query and the fetch.
///
/// Cancelling it cancels whichever of the two is active. Afterwards the completion is not called
/// anymore, except for a single [`FetchError::Cancelled`] if
/// [`report_cancellation`](LoadOptions::report_cancellation) was requested.
pub struct CombinedOperation<T> {
    inner: Arc<OperationInner<T>>,
}

impl<T> Clone for CombinedOperation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CombinedOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedOperation")
            .field("id", &self.inner.id)
            .field("locator", &self.inner.locator.as_str())
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> CombinedOperation<T> {
    fn new(
        id: u64,
        locator: Locator,
        key: CacheKey,
        report_cancellation: bool,
        completion: Completion<T>,
    ) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                id,
                locator,
                key,
                report_cancellation,
                token: CancellationToken::new(),
                state: Mutex::new(OperationState {
                    state: LoadState::Idle,
                    fetch: None,
                    completion: Some(completion),
                    ack_pending: false,
                }),
            }),
        }
    }

    pub fn locator(&self) -> &Locator {
        &self.inner.locator
    }

    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn state(&self) -> LoadState {
        self.inner.state.lock().unwrap().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cancels the load. Does nothing if it already finished.
    pub fn cancel(&self) {
        let (fetch, completion) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.state.is_terminal() {
                return;
            }
            state.state = LoadState::Cancelled;
            let completion = state.completion.take();
            state.ack_pending = self.inner.report_cancellation && completion.is_none();
            (state.fetch.take(), completion)
        };
        tracing::trace!(locator = %self.inner.locator, "Cancelling load");

        self.inner.token.cancel();
        if let Some(fetch) = fetch {
            fetch.cancel();
        }
        if self.inner.report_cancellation
            && let Some(mut completion) = completion
        {
            completion(Err(self.cancelled_error()));
        }
    }

    fn cancelled_error(&self) -> LoadError {
        LoadError::new(self.inner.locator.clone(), FetchError::Cancelled)
    }

    fn set_state(&self, next: LoadState) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.state.is_terminal() {
            state.state = next;
        }
    }

    /// Remembers the fetch to cancel along with this operation.
    ///
    /// Returns `false` if the operation was cancelled already.
    fn attach_fetch(&self, fetch: FetchCanceller) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.state == LoadState::Cancelled {
            return false;
        }
        state.fetch = Some(fetch);
        true
    }

    /// Delivers an intermediate result.
    fn deliver(&self, result: LoadResult<T>) {
        let completion = {
            let mut state = self.inner.state.lock().unwrap();
            if state.state.is_terminal() {
                return;
            }
            state.completion.take()
        };
        let Some(mut completion) = completion else {
            return;
        };

        completion(result);

        let acknowledge = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.state.is_terminal() && state.completion.is_none() {
                state.completion = Some(completion);
                return;
            }
            std::mem::take(&mut state.ack_pending)
        };
        // cancelled while the result was being delivered
        if acknowledge {
            completion(Err(self.cancelled_error()));
        }
    }

    /// Delivers the final result.
    fn complete(&self, result: LoadResult<T>) {
        let completion = {
            let mut state = self.inner.state.lock().unwrap();
            if state.state.is_terminal() {
                return;
            }
            state.state = LoadState::Done;
            state.fetch = None;
            state.completion.take()
        };
        if let Some(mut completion) = completion {
            completion(result);
        }
    }

    fn fail(&self, error: FetchError) {
        self.complete(Err(LoadError::new(self.inner.locator.clone(), error)));
    }
}

impl<T> Operation for CombinedOperation<T> {
    fn cancel(&self) {
        CombinedOperation::cancel(self)
    }

    fn is_cancelled(&self) -> bool {
        CombinedOperation::is_cancelled(self)
    }
}

struct LoaderInner<T> {
    cache: Arc<ContentCache<T>>,
    fetcher: FetchManager,
    policy: LoadPolicy<T>,
    runtime: tokio::runtime::Handle,
    running: Mutex<HashMap<u64, CombinedOperation<T>>>,
    next_id: AtomicU64,
}

/// Loads content from the cache, or fetches and caches it on a miss.
pub struct LoadService<T> {
    inner: Arc<LoaderInner<T>>,
}

impl<T> Clone for LoadService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> fmt::Debug for LoadService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadService")
            .field("cache", &self.inner.cache)
            .field("fetcher", &self.inner.fetcher)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl<T: Send + Sync + 'static> LoadService<T> {
    pub fn new(
        cache: Arc<ContentCache<T>>,
        fetcher: FetchManager,
        policy: LoadPolicy<T>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                cache,
                fetcher,
                policy,
                runtime,
                running: Default::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache<T>> {
        &self.inner.cache
    }

    pub fn fetcher(&self) -> &FetchManager {
        &self.inner.fetcher
    }

    /// The key `locator` is cached under, after applying the key filter and transformer.
    pub fn cache_key_for(&self, locator: &Locator) -> CacheKey {
        self.inner.policy.cache_key_for(locator)
    }

    /// Loads the content behind `locator`.
    ///
    /// The cache is queried first, and the content is fetched and stored on a miss. `completion`
    /// receives the result. It is called right away for a memory hit, and from the runtime
    /// otherwise. With [`refresh_cached`](LoadOptions::refresh_cached), a cached value is
    /// delivered with `finished: false` first, followed by the freshly fetched one.
    pub fn load<F>(
        &self,
        locator: Locator,
        options: LoadOptions,
        progress: Option<ProgressFn>,
        completion: F,
    ) -> CombinedOperation<T>
    where
        F: FnMut(LoadResult<T>) + Send + 'static,
    {
        let options = self.inner.policy.process_options(&locator, options);
        let key = self.inner.policy.cache_key_for(&locator);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = CombinedOperation::new(
            id,
            locator,
            key,
            options.report_cancellation,
            Box::new(completion),
        );

        let mut cached = None;
        if !options.from_loader_only
            && !options.query_memory_data
            && options.query_tier.includes_memory()
        {
            operation.set_state(LoadState::CacheQuerying);
            if let Some(hit) = self.inner.cache.query_memory(operation.key(), &options)
                && let Some(value) = hit.value
            {
                let loaded = Loaded {
                    value,
                    payload: hit.payload,
                    tier: hit.tier,
                    locator: operation.locator().clone(),
                    finished: !options.refresh_cached,
                };
                if !options.refresh_cached {
                    operation.complete(Ok(loaded));
                    return operation;
                }
                operation.deliver(Ok(loaded.clone()));
                cached = Some(loaded);
            }
        }

        self.inner
            .running
            .lock()
            .unwrap()
            .insert(id, operation.clone());
        let guard = {
            let inner = Arc::clone(&self.inner);
            CallOnDrop::new(move || {
                inner.running.lock().unwrap().remove(&id);
            })
        };

        let load = LoadTask {
            inner: Arc::clone(&self.inner),
            operation: operation.clone(),
            options,
            progress,
        };
        let token = operation.inner.token.clone();
        let job = async move {
            let _guard = guard;
            tokio::select! {
                biased;

                _ = token.cancelled() => {}
                _ = load.run(cached) => {}
            }
        };
        self.inner
            .runtime
            .spawn(job.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));

        operation
    }

    /// Cancels all loads that are not finished yet.
    pub fn cancel_all(&self) {
        let operations: Vec<_> = self.inner.running.lock().unwrap().drain().collect();
        for (_, operation) in operations {
            operation.cancel();
        }
    }

    /// Whether any load is not finished yet.
    pub fn is_running(&self) -> bool {
        !self.inner.running.lock().unwrap().is_empty()
    }
}

/// The asynchronous part of one load.
struct LoadTask<T> {
    inner: Arc<LoaderInner<T>>,
    operation: CombinedOperation<T>,
    options: LoadOptions,
    progress: Option<ProgressFn>,
}

impl<T: Send + Sync + 'static> LoadTask<T> {
    async fn run(self, mut cached: Option<Loaded<T>>) {
        let operation = &self.operation;
        let locator = operation.locator();
        let options = &self.options;

        if cached.is_none() && !options.from_loader_only {
            operation.set_state(LoadState::CacheQuerying);
            let hit = self.inner.cache.query(operation.key(), options).await;
            if let Some(value) = hit.value {
                let loaded = Loaded {
                    value,
                    payload: hit.payload,
                    tier: hit.tier,
                    locator: locator.clone(),
                    finished: !options.refresh_cached,
                };
                if !options.refresh_cached {
                    operation.complete(Ok(loaded));
                    return;
                }
                operation.deliver(Ok(loaded.clone()));
                cached = Some(loaded);
            }
        }

        if options.from_cache_only || !self.inner.policy.allows_fetch(locator) {
            match cached {
                Some(mut loaded) => {
                    loaded.finished = true;
                    operation.complete(Ok(loaded));
                }
                None => operation.fail(FetchError::NotAllowed),
            }
            return;
        }

        operation.set_state(LoadState::Fetching);
        let request = FetchRequest {
            priority: options.priority,
            retry_failed: options.retry_failed,
            progress: self.progress.clone().map(|progress| {
                let token = operation.inner.token.clone();
                Arc::new(move |update: FetchProgress| {
                    if !token.is_cancelled() {
                        progress(update);
                    }
                }) as ProgressFn
            }),
        };
        let handle = self.inner.fetcher.submit(locator.clone(), request);
        if !operation.attach_fetch(handle.canceller()) {
            return;
        }

        let payload = match handle.await {
            Ok(payload) => payload,
            Err(error) => return operation.fail(error),
        };

        let value = match self.decode(payload.clone()).await {
            Ok(value) => value,
            Err(error) => {
                self.inner.fetcher.report_failure(locator, &error);
                return operation.fail(error);
            }
        };

        operation.set_state(LoadState::Storing);
        let value = Arc::new(value);
        let key = operation.key();
        let tier = options.store_tier;
        let cache = &self.inner.cache;
        match self.inner.policy.persist(&value, &payload, locator) {
            Persist::Payload(bytes) => {
                cache.store(Some(value.clone()), Some(bytes), key, tier).await
            }
            Persist::Encode => cache.store(Some(value.clone()), None, key, tier).await,
            Persist::MemoryOnly => {
                cache
                    .store(Some(value.clone()), None, key, tier.without_disk())
                    .await
            }
        }

        operation.complete(Ok(Loaded {
            value,
            payload: Some(payload),
            tier: CacheType::None,
            locator: locator.clone(),
            finished: true,
        }));
    }

    /// Decodes fetched bytes and applies the transformer.
    async fn decode(&self, payload: Bytes) -> Result<T, FetchError> {
        let operation = &self.operation;
        let value = self
            .inner
            .cache
            .decode(payload, operation.key(), &self.options)
            .await
            .ok_or_else(|| FetchError::Malformed("failed to decode fetched content".into()))?;

        let Some(transformer) = self.inner.policy.transformer().cloned() else {
            return Ok(value);
        };
        let locator = operation.locator().clone();
        let name = transformer.cache_key().to_owned();
        self.inner
            .runtime
            .spawn_blocking(move || transformer.transform(value, &locator))
            .await
            .ok()
            .flatten()
            .ok_or_else(|| FetchError::Malformed(format!("failed to apply transformer `{name}`")))
    }
}
