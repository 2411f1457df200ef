//! Provides the load orchestration built on top of the cache and the fetch layer.
//!
//! The [`Context`] creates all the pieces from a [`Config`] and hands them to whoever needs them.
//! There is no implicit global state. A process that wants one anyway can
//! [install](Context::install_default) a default context once at startup.

use std::sync::{Arc, OnceLock};

use anyhow::{Context as _, Result};
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::caching::{ContentCache, Decoder};
use crate::config::Config;
use crate::download::{FetchManager, Fetcher, ProgressFn};
use crate::types::{Locator, LoadOptions};

mod loader;
mod policy;
mod registry;

pub use loader::{CombinedOperation, LoadResult, LoadService, LoadState, Loaded};
pub use policy::{
    CacheSerializer, KeyFilter, LoadPolicy, OptionsProcessor, ShouldFetch, Transformer,
};
pub use registry::{Operation, OperationRegistry, Owner, OwnerId};

static DEFAULT_CONTEXT: OnceLock<Context<Bytes>> = OnceLock::new();

/// All services of one cache, created together from a [`Config`].
pub struct Context<T> {
    pub cache: Arc<ContentCache<T>>,
    pub fetcher: FetchManager,
    pub loader: LoadService<T>,
    pub registry: OperationRegistry,
    maintenance: Option<JoinHandle<()>>,
}

impl<T> std::fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cache", &self.cache)
            .field("fetcher", &self.fetcher)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Context<T> {
    /// Creates the cache tiers, the fetch manager and the loader.
    ///
    /// Leftover temporary files of the disk tier are removed, and its background sweep is started
    /// if [`sweep_interval`](crate::config::DiskCacheConfig::sweep_interval) is set.
    pub fn from_config(
        config: &Config,
        decoder: Arc<dyn Decoder<T>>,
        fetcher: Arc<dyn Fetcher>,
        policy: LoadPolicy<T>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        let cache = ContentCache::from_config(config, decoder, runtime.clone())
            .context("failed to create the disk cache")?;

        let mut maintenance = None;
        if let Some(disk) = cache.disk() {
            disk.clear_tmp().context("failed to clear tmp caches")?;
            if let Some(interval) = config.caches.disk.sweep_interval
                && !interval.is_zero()
            {
                maintenance = Some(disk.spawn_maintenance(&runtime, interval));
            }
        }

        let cache = Arc::new(cache);
        let fetcher = FetchManager::new(config.fetch.clone(), fetcher, runtime.clone());
        let loader = LoadService::new(Arc::clone(&cache), fetcher.clone(), policy, runtime);

        Ok(Self {
            cache,
            fetcher,
            loader,
            registry: OperationRegistry::new(),
            maintenance,
        })
    }

    /// Loads `locator` on behalf of `owner`.
    ///
    /// A load that is still running for the same owner and cache key is cancelled before the new
    /// one starts.
    pub fn load_for_owner<F>(
        &self,
        owner: &Owner,
        locator: Locator,
        options: LoadOptions,
        progress: Option<ProgressFn>,
        completion: F,
    ) -> CombinedOperation<T>
    where
        F: FnMut(LoadResult<T>) + Send + 'static,
    {
        let key = self.loader.cache_key_for(&locator);
        self.registry.associate_with(owner.id(), key.as_str(), || {
            self.loader.load(locator, options, progress, completion)
        })
    }
}

impl Context<Bytes> {
    /// Installs the process wide default context.
    ///
    /// This can only happen once. Later calls hand the context back.
    pub fn install_default(context: Self) -> Result<(), Self> {
        DEFAULT_CONTEXT.set(context)
    }

    /// The context installed by [`install_default`](Self::install_default), if any.
    pub fn default_instance() -> Option<&'static Self> {
        DEFAULT_CONTEXT.get()
    }
}

impl<T> Drop for Context<T> {
    fn drop(&mut self) {
        if let Some(maintenance) = self.maintenance.take() {
            maintenance.abort();
        }
    }
}
