//! Helpers for testing the cache and the fetch layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function (e.g.
//!    `let cache_dir = test::tempdir()`).
//!
//!  - When using a [`HitCounter`], hold it until all requests to it have been made. Dropping it
//!    stops the server and further connections fail.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::{Router, extract, middleware};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use contentcache_service::download::{FetchError, FetchResult, Fetcher, Progress};
use contentcache_service::types::Locator;
use contentcache_service::utils::futures::CallOnDrop;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `contentcache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("contentcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Parses `url` into a [`Locator`].
pub fn locator(url: &str) -> Locator {
    url.parse().unwrap()
}

#[derive(Default)]
struct Script {
    responses: Mutex<HashMap<String, FetchResult>>,
    calls: Mutex<BTreeMap<String, usize>>,
    started: Mutex<Vec<String>>,
    cancelled: AtomicUsize,
    gate: Option<Semaphore>,
    chunks: usize,
    delay: Option<Duration>,
}

/// A [`Fetcher`] with scripted responses.
///
/// Every locator answers with the response registered for it, or with
/// [`FetchError::NotFound`]. Fetches can be held open with a gate, report their progress in
/// chunks, and are counted per locator.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    script: Arc<Script>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every fetch open until it is let through with [`release`](Self::release).
    pub fn gated() -> Self {
        Self::build(Some(Semaphore::new(0)), 1, None)
    }

    /// Reports the progress of every fetch in `chunks` steps.
    pub fn chunked(chunks: usize) -> Self {
        Self::build(None, chunks, None)
    }

    /// Sleeps for `delay` before answering.
    pub fn delayed(delay: Duration) -> Self {
        Self::build(None, 1, Some(delay))
    }

    fn build(gate: Option<Semaphore>, chunks: usize, delay: Option<Duration>) -> Self {
        Self {
            script: Arc::new(Script {
                gate,
                chunks: chunks.max(1),
                delay,
                ..Default::default()
            }),
        }
    }

    /// Answers fetches for `url` with `result`.
    pub fn respond(&self, url: &str, result: FetchResult) -> &Self {
        let url = locator(url).to_string();
        self.script.responses.lock().unwrap().insert(url, result);
        self
    }

    /// Answers fetches for `url` with `body`.
    pub fn serve(&self, url: &str, body: &'static [u8]) -> &Self {
        self.respond(url, Ok(Bytes::from_static(body)))
    }

    /// Lets `n` gated fetches through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.script.gate {
            gate.add_permits(n);
        }
    }

    /// The number of fetches started for `url`.
    pub fn calls(&self, url: &str) -> usize {
        let url = locator(url).to_string();
        self.script
            .calls
            .lock()
            .unwrap()
            .get(&url)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.script.calls.lock().unwrap().values().sum()
    }

    /// The locators of all started fetches, in the order they were started.
    pub fn started(&self) -> Vec<String> {
        self.script.started.lock().unwrap().clone()
    }

    /// The number of fetches that were dropped before they finished.
    pub fn cancelled(&self) -> usize {
        self.script.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` fetches have started.
    pub async fn wait_started(&self, n: usize) {
        for _ in 0..200 {
            if self.script.started.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {:?} fetches started, expected {n}", self.started());
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, locator: &'a Locator, progress: Progress) -> BoxFuture<'a, FetchResult> {
        async move {
            let script = &self.script;
            let url = locator.to_string();
            *script.calls.lock().unwrap().entry(url.clone()).or_default() += 1;
            script.started.lock().unwrap().push(url.clone());

            let guard = {
                let script = Arc::clone(script);
                CallOnDrop::new(move || {
                    script.cancelled.fetch_add(1, Ordering::SeqCst);
                })
            };

            if let Some(gate) = &script.gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }

            let result = script
                .responses
                .lock()
                .unwrap()
                .get(&url)
                .cloned()
                .unwrap_or(Err(FetchError::NotFound));

            if let Ok(bytes) = &result {
                let len = bytes.len() as u64;
                let chunks = script.chunks as u64;
                for chunk in 1..=chunks {
                    progress.report(len * chunk / chunks, Some(len));
                }
            }

            guard.disarm();
            result
        }
        .boxed()
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Locator {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An HTTP server that counts the requests to each path.
///
/// It serves the following routes:
///
/// - `/redirect/*path` redirects to `/path`.
/// - `/delay/:time/*path` waits for `time` and then redirects to `/path`.
/// - `/respond_statuscode/:num/*tail` responds with status `num` and no body.
/// - `/garbage_data/*tail` responds with `tail` as the body.
/// - `/bytes/:size/*tail` responds with a body of `size` bytes.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/redirect/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [("Location", format!("/{path}"))])
                }),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/bytes/:size/*tail",
                get(
                    |extract::Path((size, _)): extract::Path<(usize, String)>| async move {
                        vec![b'x'; size]
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of requests and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests per path and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Locator {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
