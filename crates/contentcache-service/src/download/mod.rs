//! Fetching content from its locator.
//!
//! The [`FetchManager`] runs fetches on a bounded number of workers. Concurrent submissions for
//! the same locator are coalesced into a single transport operation, while every submission still
//! gets its own [`FetchTaskHandle`], progress callback and result. The transport itself is
//! abstracted by the [`Fetcher`] trait, with implementations for HTTP and the local file system.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use sentry::SentryFutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::types::{Locator, Priority};
use crate::utils::futures::{m, measure};

mod deny_list;
mod error;
pub mod filesystem;
pub mod http;
mod progress;
mod queue;
mod scheme;

use deny_list::Blocklist;
use progress::ProgressThrottle;
use queue::AdmissionQueue;

pub use error::{FetchError, LoadError};
pub use filesystem::FilesystemFetcher;
pub use http::HttpFetcher;
pub use progress::{FetchProgress, Progress, ProgressFn};
pub use scheme::SchemeFetcher;

/// The outcome of a single fetch.
pub type FetchResult = Result<Bytes, FetchError>;

/// Retrieves the bytes behind a locator.
///
/// Implementations report received bytes to `progress` and must stop all work as soon as the
/// returned future is dropped, which is how fetches are cancelled and timed out.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, locator: &'a Locator, progress: Progress) -> BoxFuture<'a, FetchResult>;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch<'a>(&'a self, locator: &'a Locator, progress: Progress) -> BoxFuture<'a, FetchResult> {
        (**self).fetch(locator, progress)
    }
}

/// Classifies a failure as terminal, which counts it towards blocking the locator.
pub type ErrorClassifier = Arc<dyn Fn(&FetchError) -> bool + Send + Sync>;
/// Decides per locator whether a failure blocks it, overriding the classification.
pub type BlockPredicate = Arc<dyn Fn(&Locator, &FetchError) -> bool + Send + Sync>;

/// Hooks that adjust how failures are treated.
#[derive(Clone, Default)]
pub struct FetchPolicy {
    /// Defaults to [`FetchError::is_terminal`].
    pub is_terminal: Option<ErrorClassifier>,
    pub should_block_failed: Option<BlockPredicate>,
}

impl FetchPolicy {
    fn blocks(&self, locator: &Locator, error: &FetchError) -> bool {
        if matches!(error, FetchError::Cancelled | FetchError::Blocked(_)) {
            return false;
        }
        if let Some(should_block) = &self.should_block_failed {
            return should_block(locator, error);
        }
        match &self.is_terminal {
            Some(is_terminal) => is_terminal(error),
            None => error.is_terminal(),
        }
    }
}

impl fmt::Debug for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPolicy")
            .field("is_terminal", &self.is_terminal.is_some())
            .field("should_block_failed", &self.should_block_failed.is_some())
            .finish()
    }
}

/// Per-submission parameters of [`FetchManager::submit`].
#[derive(Clone, Default)]
pub struct FetchRequest {
    pub priority: Priority,
    /// Fetch even if the locator is blocked.
    pub retry_failed: bool,
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("priority", &self.priority)
            .field("retry_failed", &self.retry_failed)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// One submission waiting for the result of a [`FetchTask`].
struct Subscriber {
    id: u64,
    sender: oneshot::Sender<FetchResult>,
    progress: Option<ProgressFn>,
    throttle: ProgressThrottle,
    detached: Arc<AtomicBool>,
}

impl Subscriber {
    fn cancel(self) {
        self.detached.store(true, Ordering::Release);
        let _ = self.sender.send(Err(FetchError::Cancelled));
    }
}

/// A transport operation for one locator, shared by all of its subscribers.
struct FetchTask {
    id: u64,
    locator: Locator,
    priority: Priority,
    token: CancellationToken,
    subscribers: Mutex<Vec<Subscriber>>,
}

struct ManagerState {
    queue: AdmissionQueue<Arc<FetchTask>>,
    /// Queued and running tasks by locator.
    in_flight: HashMap<Locator, Arc<FetchTask>>,
    running: usize,
}

struct ManagerInner {
    config: FetchConfig,
    fetcher: Arc<dyn Fetcher>,
    runtime: tokio::runtime::Handle,
    // Lock order: `state` before any `FetchTask::subscribers`.
    state: Mutex<ManagerState>,
    blocklist: Blocklist,
    policy: FetchPolicy,
    next_id: AtomicU64,
}

/// Runs fetches with bounded concurrency.
///
/// At most [`max_concurrent`](FetchConfig::max_concurrent) fetches run at once; the others wait
/// in an admission queue. Each fetch is limited by [`timeout`](FetchConfig::timeout). Locators
/// that failed terminally are blocked and later submissions for them fail right away.
#[derive(Clone)]
pub struct FetchManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for FetchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (queued, running) = self.stats();
        f.debug_struct("FetchManager")
            .field("config", &self.inner.config)
            .field("queued", &queued)
            .field("running", &running)
            .finish()
    }
}

impl FetchManager {
    pub fn new(
        config: FetchConfig,
        fetcher: Arc<dyn Fetcher>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self::with_policy(config, fetcher, runtime, FetchPolicy::default())
    }

    pub fn with_policy(
        config: FetchConfig,
        fetcher: Arc<dyn Fetcher>,
        runtime: tokio::runtime::Handle,
        policy: FetchPolicy,
    ) -> Self {
        let state = ManagerState {
            queue: AdmissionQueue::new(config.admission_order),
            in_flight: HashMap::new(),
            running: 0,
        };
        Self {
            inner: Arc::new(ManagerInner {
                blocklist: Blocklist::from_config(&config),
                config,
                fetcher,
                runtime,
                state: Mutex::new(state),
                policy,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Submits a fetch for `locator`.
    ///
    /// If a fetch for the same locator is already queued or running, this attaches to it instead
    /// of starting another one. If the locator is blocked, the returned handle resolves to
    /// [`FetchError::Blocked`] right away without invoking the fetcher.
    pub fn submit(&self, locator: Locator, request: FetchRequest) -> FetchTaskHandle {
        metric!(counter("fetch.submitted") += 1);

        if !request.retry_failed
            && let Some(reason) = self.inner.blocklist.is_blocked(&locator)
        {
            tracing::debug!(%locator, "Locator is blocked, not fetching");
            metric!(counter("fetch.blocked") += 1);
            let error = self.inner.blocklist.format_error(&locator, &reason);
            return FetchTaskHandle::ready(Err(error));
        }

        let (sender, receiver) = oneshot::channel();
        let subscriber_id = self.inner.next_id();
        let detached = Arc::new(AtomicBool::new(false));
        let subscriber = Subscriber {
            id: subscriber_id,
            sender,
            progress: request.progress,
            throttle: ProgressThrottle::new(self.inner.config.minimum_progress_interval()),
            detached: detached.clone(),
        };

        let task = {
            let mut state = self.inner.state.lock().unwrap();
            match state.in_flight.get(&locator) {
                Some(task) => {
                    tracing::trace!(%locator, "Coalescing with in-flight fetch");
                    metric!(counter("fetch.coalesced") += 1);
                    task.subscribers.lock().unwrap().push(subscriber);
                    Arc::clone(task)
                }
                None => {
                    let task = Arc::new(FetchTask {
                        id: self.inner.next_id(),
                        locator: locator.clone(),
                        priority: request.priority,
                        token: CancellationToken::new(),
                        subscribers: Mutex::new(vec![subscriber]),
                    });
                    state.in_flight.insert(locator, Arc::clone(&task));
                    state.queue.push(task.priority, Arc::clone(&task));
                    metric!(gauge("fetch.queue.pending") = state.queue.len() as u64);
                    task
                }
            }
        };

        self.inner.pump();

        FetchTaskHandle {
            receiver,
            canceller: FetchCanceller {
                target: Some(Arc::new(CancelTarget {
                    manager: Arc::downgrade(&self.inner),
                    task,
                    subscriber_id,
                })),
                token: CancellationToken::new(),
                detached,
            },
            done: false,
        }
    }

    /// Cancels every queued and running fetch.
    ///
    /// All outstanding handles resolve to [`FetchError::Cancelled`].
    pub fn cancel_all(&self) {
        let tasks: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.drain();
            state.in_flight.drain().map(|(_, task)| task).collect()
        };
        tracing::debug!("Cancelling {} fetches", tasks.len());

        for task in tasks {
            task.token.cancel();
            let subscribers = std::mem::take(&mut *task.subscribers.lock().unwrap());
            for subscriber in subscribers {
                subscriber.cancel();
            }
        }
    }

    /// Records a failure that was only detected after the fetch succeeded, like content that
    /// cannot be decoded.
    pub fn report_failure(&self, locator: &Locator, error: &FetchError) {
        if self.inner.policy.blocks(locator, error) {
            self.inner.blocklist.register_failure(locator, error);
        }
    }

    /// Whether `locator` is currently blocked.
    pub fn is_blocked(&self, locator: &Locator) -> bool {
        self.inner.blocklist.is_blocked(locator).is_some()
    }

    /// Unblocks `locator` and forgets its failures.
    pub fn remove_failed(&self, locator: &Locator) {
        self.inner.blocklist.remove(locator);
    }

    /// Unblocks all locators.
    pub fn clear_failed(&self) {
        self.inner.blocklist.clear();
    }

    /// The number of queued and running fetches.
    pub fn stats(&self) -> (usize, usize) {
        let state = self.inner.state.lock().unwrap();
        (state.queue.len(), state.running)
    }
}

impl ManagerInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Starts queued tasks while there are free workers.
    fn pump(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                if state.running >= self.config.max_concurrent() {
                    return;
                }
                let Some(task) = state.queue.pop() else {
                    return;
                };
                state.running += 1;
                metric!(gauge("fetch.queue.pending") = state.queue.len() as u64);
                task
            };
            self.spawn_fetch(task);
        }
    }

    fn spawn_fetch(self: &Arc<Self>, task: Arc<FetchTask>) {
        let inner = Arc::clone(self);
        let job = async move {
            tracing::debug!(locator = %task.locator, priority = ?task.priority, "Starting fetch");
            let progress = progress_sink(&task);
            let timeout = inner.config.timeout;

            let fetch = async {
                tokio::select! {
                    biased;

                    _ = task.token.cancelled() => Err(FetchError::Cancelled),
                    result = tokio::time::timeout(timeout, inner.fetcher.fetch(&task.locator, progress)) => {
                        result.unwrap_or(Err(FetchError::Timeout(timeout)))
                    }
                }
            };
            let result = measure("fetch.duration", m::fetched, fetch).await;

            match &result {
                Ok(bytes) => {
                    tracing::debug!(locator = %task.locator, "Fetched {} bytes", bytes.len());
                }
                Err(FetchError::Cancelled) => {
                    tracing::debug!(locator = %task.locator, "Fetch cancelled");
                }
                Err(error) => {
                    tracing::debug!(locator = %task.locator, %error, "Fetch failed");
                    metric!(counter("fetch.failure") += 1, "status" => error.as_status());
                }
            }

            inner.finish(&task, result);
        };

        self.runtime
            .spawn(job.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));
    }

    /// Delivers the result of a finished task and frees its worker.
    fn finish(self: &Arc<Self>, task: &Arc<FetchTask>, result: FetchResult) {
        match &result {
            Ok(_) => self.blocklist.remove(&task.locator),
            Err(error) if self.policy.blocks(&task.locator, error) => {
                self.blocklist.register_failure(&task.locator, error);
            }
            Err(_) => {}
        }

        let subscribers = {
            let mut state = self.state.lock().unwrap();
            if state
                .in_flight
                .get(&task.locator)
                .is_some_and(|current| current.id == task.id)
            {
                state.in_flight.remove(&task.locator);
            }
            state.running -= 1;
            std::mem::take(&mut *task.subscribers.lock().unwrap())
        };

        for mut subscriber in subscribers {
            if subscriber.detached.load(Ordering::Acquire) {
                continue;
            }
            if let (Ok(bytes), Some(progress)) = (&result, &subscriber.progress) {
                let len = bytes.len() as u64;
                let done = FetchProgress {
                    received: len,
                    expected: Some(len),
                };
                if subscriber.throttle.last_fraction() < 1.0 && subscriber.throttle.should_notify(&done)
                {
                    progress(done);
                }
            }
            let _ = subscriber.sender.send(result.clone());
        }

        self.pump();
    }

    /// Removes one subscriber from `task`, cancelling the task if it was the last one.
    fn detach(&self, task: &Arc<FetchTask>, subscriber_id: u64) {
        let subscriber = {
            let mut state = self.state.lock().unwrap();
            let mut subscribers = task.subscribers.lock().unwrap();
            let Some(pos) = subscribers.iter().position(|s| s.id == subscriber_id) else {
                return;
            };
            let subscriber = subscribers.remove(pos);

            if subscribers.is_empty() {
                tracing::debug!(locator = %task.locator, "Last subscriber left, cancelling fetch");
                if state
                    .in_flight
                    .get(&task.locator)
                    .is_some_and(|current| current.id == task.id)
                {
                    state.in_flight.remove(&task.locator);
                }
                state.queue.remove_where(|queued| queued.id == task.id);
                task.token.cancel();
            }
            subscriber
        };

        subscriber.cancel();
    }
}

/// Creates the sink the fetcher reports to, which fans out to all subscribers of `task`.
fn progress_sink(task: &Arc<FetchTask>) -> Progress {
    let task = Arc::downgrade(task);
    Progress::from_fn(move |received, expected| {
        let Some(task) = task.upgrade() else {
            return;
        };
        if task.token.is_cancelled() {
            return;
        }

        let progress = FetchProgress { received, expected };
        let notify: Vec<_> = {
            let mut subscribers = task.subscribers.lock().unwrap();
            subscribers
                .iter_mut()
                .filter_map(|subscriber| {
                    let callback = subscriber.progress.as_ref()?;
                    subscriber
                        .throttle
                        .should_notify(&progress)
                        .then(|| (callback.clone(), subscriber.detached.clone()))
                })
                .collect()
        };

        for (callback, detached) in notify {
            if !detached.load(Ordering::Acquire) {
                callback(progress);
            }
        }
    })
}

struct CancelTarget {
    manager: Weak<ManagerInner>,
    task: Arc<FetchTask>,
    subscriber_id: u64,
}

/// Cancels the submission of a [`FetchTaskHandle`] from anywhere.
#[derive(Clone)]
pub struct FetchCanceller {
    target: Option<Arc<CancelTarget>>,
    token: CancellationToken,
    detached: Arc<AtomicBool>,
}

impl FetchCanceller {
    /// Detaches this submission from its fetch.
    ///
    /// The handle resolves to [`FetchError::Cancelled`], and no more progress is reported to it.
    /// The transport is only cancelled once no other submission waits for the same fetch.
    pub fn cancel(&self) {
        self.detached.store(true, Ordering::Release);
        self.token.cancel();
        if let Some(target) = &self.target
            && let Some(manager) = target.manager.upgrade()
        {
            manager.detach(&target.task, target.subscriber_id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for FetchCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCanceller")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The result of one [`FetchManager::submit`].
///
/// Dropping the handle before it resolved cancels the submission.
#[must_use = "dropping the handle cancels the fetch"]
pub struct FetchTaskHandle {
    receiver: oneshot::Receiver<FetchResult>,
    canceller: FetchCanceller,
    done: bool,
}

impl FetchTaskHandle {
    fn ready(result: FetchResult) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self {
            receiver,
            canceller: FetchCanceller {
                target: None,
                token: CancellationToken::new(),
                detached: Default::default(),
            },
            done: false,
        }
    }

    pub fn canceller(&self) -> FetchCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }
}

impl fmt::Debug for FetchTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchTaskHandle")
            .field("cancelled", &self.canceller.is_cancelled())
            .field("done", &self.done)
            .finish()
    }
}

impl Future for FetchTaskHandle {
    type Output = FetchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.canceller.is_cancelled() {
            self.done = true;
            return Poll::Ready(Err(FetchError::Cancelled));
        }
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or(Err(FetchError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for FetchTaskHandle {
    fn drop(&mut self) {
        if !self.done {
            self.canceller.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::config::AdmissionOrder;
    use crate::test::{self, FnFetcher};

    use super::*;

    fn manager(config: FetchConfig, fetcher: impl Fetcher) -> FetchManager {
        FetchManager::new(config, Arc::new(fetcher), tokio::runtime::Handle::current())
    }

    /// A fetcher that waits until it is released, then echoes the locator.
    #[derive(Clone)]
    struct GatedFetcher {
        gate: Arc<tokio::sync::Semaphore>,
        started: Arc<Mutex<Vec<String>>>,
        dropped: Arc<AtomicUsize>,
    }

    impl Default for GatedFetcher {
        fn default() -> Self {
            Self {
                gate: Arc::new(tokio::sync::Semaphore::new(0)),
                started: Default::default(),
                dropped: Default::default(),
            }
        }
    }

    impl GatedFetcher {
        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    impl Fetcher for GatedFetcher {
        fn fetch<'a>(
            &'a self,
            locator: &'a Locator,
            progress: Progress,
        ) -> BoxFuture<'a, FetchResult> {
            Box::pin(async move {
                let dropped = self.dropped.clone();
                let guard = crate::utils::futures::CallOnDrop::new(move || {
                    dropped.fetch_add(1, Ordering::SeqCst);
                });
                self.started.lock().unwrap().push(locator.path().to_owned());
                let permit = self.gate.acquire().await.map_err(|_| FetchError::InternalError)?;
                permit.forget();
                progress.report(2, Some(4));
                guard.disarm();
                Ok(Bytes::from(locator.path().to_owned()))
            })
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_fetch() {
        test::setup();
        let fetcher = FnFetcher::echo();
        let manager = manager(FetchConfig::default(), fetcher.clone());

        let locator = test::locator("https://example.com/a.png");
        let result = manager.submit(locator, Default::default()).await;
        assert_eq!(result.unwrap(), "https://example.com/a.png");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_bounded_concurrency_fifo() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let config = FetchConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let manager = manager(config, fetcher.clone());

        let first = manager.submit(test::locator("http://test/1"), Default::default());
        let second = manager.submit(test::locator("http://test/2"), Default::default());
        let third = manager.submit(test::locator("http://test/3"), Default::default());
        settle().await;
        assert_eq!(fetcher.started(), ["/1"]);
        assert_eq!(manager.stats(), (2, 1));

        fetcher.release(1);
        assert_eq!(first.await.unwrap(), "/1");
        settle().await;
        assert_eq!(fetcher.started(), ["/1", "/2"]);

        fetcher.release(2);
        assert_eq!(second.await.unwrap(), "/2");
        assert_eq!(third.await.unwrap(), "/3");
        assert_eq!(manager.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_lifo_and_priority() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let config = FetchConfig {
            max_concurrent: 1,
            admission_order: AdmissionOrder::Lifo,
            ..Default::default()
        };
        let manager = manager(config, fetcher.clone());

        let handles = vec![
            manager.submit(test::locator("http://test/0"), Default::default()),
            manager.submit(test::locator("http://test/1"), Default::default()),
            manager.submit(test::locator("http://test/2"), Default::default()),
            manager.submit(
                test::locator("http://test/low"),
                FetchRequest {
                    priority: Priority::Low,
                    ..Default::default()
                },
            ),
        ];
        fetcher.release(10);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(fetcher.started(), ["/0", "/2", "/1", "/low"]);
    }

    #[tokio::test]
    async fn test_cancel_queued() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let config = FetchConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let manager = manager(config, fetcher.clone());

        let first = manager.submit(test::locator("http://test/1"), Default::default());
        let second = manager.submit(test::locator("http://test/2"), Default::default());
        second.cancel();
        assert_eq!(second.await, Err(FetchError::Cancelled));
        assert_eq!(manager.stats(), (0, 1));

        fetcher.release(1);
        first.await.unwrap();
        settle().await;
        assert_eq!(fetcher.started(), ["/1"]);
    }

    #[tokio::test]
    async fn test_cancel_running_drops_transport() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let manager = manager(FetchConfig::default(), fetcher.clone());

        let handle = manager.submit(test::locator("http://test/1"), Default::default());
        settle().await;
        assert_eq!(fetcher.started(), ["/1"]);

        drop(handle);
        settle().await;
        assert_eq!(fetcher.dropped.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_coalescing() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let manager = manager(FetchConfig::default(), fetcher.clone());
        let locator = test::locator("http://test/same");

        let first = manager.submit(locator.clone(), Default::default());
        let second = manager.submit(locator.clone(), Default::default());
        let third = manager.submit(locator.clone(), Default::default());

        // detaching one subscriber keeps the fetch alive for the others
        third.cancel();
        assert_eq!(third.await, Err(FetchError::Cancelled));

        fetcher.release(1);
        assert_eq!(first.await.unwrap(), "/same");
        assert_eq!(second.await.unwrap(), "/same");
        assert_eq!(fetcher.started().len(), 1);
        assert_eq!(fetcher.dropped.load(Ordering::SeqCst), 0);

        // a later submission fetches again
        fetcher.release(1);
        manager.submit(locator, Default::default()).await.unwrap();
        assert_eq!(fetcher.started().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let config = FetchConfig {
            timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let manager = manager(config, fetcher.clone());

        let result = manager
            .submit(test::locator("http://test/slow"), Default::default())
            .await;
        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(20))));
        // timeouts are transient
        assert!(!manager.is_blocked(&test::locator("http://test/slow")));
    }

    #[tokio::test]
    async fn test_blocklist() {
        test::setup();
        let fetcher = FnFetcher::new(|_| Err(FetchError::NotFound));
        let config = FetchConfig {
            blocklist_threshold: 2,
            ..Default::default()
        };
        let manager = manager(config, fetcher.clone());
        let locator = test::locator("https://example.com/missing.png");

        for _ in 0..2 {
            let result = manager.submit(locator.clone(), Default::default()).await;
            assert_eq!(result, Err(FetchError::NotFound));
        }
        let result = manager.submit(locator.clone(), Default::default()).await;
        assert!(matches!(result, Err(FetchError::Blocked(_))));
        assert_eq!(fetcher.calls(), 2);

        let retry = FetchRequest {
            retry_failed: true,
            ..Default::default()
        };
        let result = manager.submit(locator.clone(), retry).await;
        assert_eq!(result, Err(FetchError::NotFound));
        assert_eq!(fetcher.calls(), 3);

        manager.remove_failed(&locator);
        assert!(!manager.is_blocked(&locator));
    }

    #[tokio::test]
    async fn test_should_block_failed_hook() {
        test::setup();
        let fetcher = FnFetcher::new(|_| Err(FetchError::Transport("reset".into())));
        let policy = FetchPolicy {
            should_block_failed: Some(Arc::new(|locator: &Locator, _: &FetchError| {
                locator.host_str() == Some("flaky.example.com")
            })),
            ..Default::default()
        };
        let manager = FetchManager::with_policy(
            FetchConfig::default(),
            Arc::new(fetcher),
            tokio::runtime::Handle::current(),
            policy,
        );

        let flaky = test::locator("https://flaky.example.com/a");
        let other = test::locator("https://other.example.com/a");
        let _ = manager.submit(flaky.clone(), Default::default()).await;
        let _ = manager.submit(other.clone(), Default::default()).await;
        assert!(manager.is_blocked(&flaky));
        assert!(!manager.is_blocked(&other));

        manager.clear_failed();
        assert!(!manager.is_blocked(&flaky));
    }

    #[tokio::test]
    async fn test_progress_final_notification() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let config = FetchConfig {
            minimum_progress_interval: 0.75,
            ..Default::default()
        };
        let manager = manager(config, fetcher.clone());

        let reports = Arc::new(Mutex::new(Vec::new()));
        let request = FetchRequest {
            progress: Some({
                let reports = reports.clone();
                Arc::new(move |progress: FetchProgress| {
                    reports.lock().unwrap().push(progress.fraction());
                })
            }),
            ..Default::default()
        };

        fetcher.release(1);
        let result = manager
            .submit(test::locator("http://test/abcd"), request)
            .await;
        assert_eq!(result.unwrap(), "/abcd");
        // the intermediate 50% is throttled, the final 100% is not
        assert_eq!(*reports.lock().unwrap(), [Some(1.0)]);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        test::setup();
        let fetcher = GatedFetcher::default();
        let config = FetchConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let manager = manager(config, fetcher.clone());

        let first = manager.submit(test::locator("http://test/1"), Default::default());
        let second = manager.submit(test::locator("http://test/2"), Default::default());
        settle().await;

        manager.cancel_all();
        assert_eq!(first.await, Err(FetchError::Cancelled));
        assert_eq!(second.await, Err(FetchError::Cancelled));
        settle().await;
        assert_eq!(manager.stats(), (0, 0));
        assert_eq!(fetcher.started(), ["/1"]);
    }
}
