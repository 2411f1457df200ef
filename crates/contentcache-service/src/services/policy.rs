use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::caching::CacheKey;
use crate::types::{Locator, LoadOptions};

/// Derives the cache key from a locator. Defaults to the locator's canonical string form.
pub type KeyFilter = Arc<dyn Fn(&Locator) -> String + Send + Sync>;

/// Decides which bytes to persist for a fetched value.
///
/// It receives the final value, the fetched bytes and the locator. Returning `None` or empty
/// bytes keeps the value in memory only.
pub type CacheSerializer<T> = Arc<dyn Fn(&T, Option<&Bytes>, &Locator) -> Option<Bytes> + Send + Sync>;

/// Adjusts the options of a request, once, before the cache is queried.
pub type OptionsProcessor = Arc<dyn Fn(&Locator, LoadOptions) -> LoadOptions + Send + Sync>;

/// Decides whether a cache miss for a locator may be fetched. Defaults to always.
pub type ShouldFetch = Arc<dyn Fn(&Locator) -> bool + Send + Sync>;

/// Turns a freshly fetched and decoded value into the value that is cached and delivered.
///
/// Transformed values are cached separately from plain ones, under the base key suffixed with
/// [`cache_key`](Self::cache_key).
pub trait Transformer<T>: Send + Sync + 'static {
    /// Identifies this transformation. Must be stable across runs.
    fn cache_key(&self) -> &str;

    /// Transforms `value`, or returns `None` if that is not possible.
    fn transform(&self, value: T, locator: &Locator) -> Option<T>;
}

/// What ends up on disk for a fetched value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Persist {
    /// These bytes.
    Payload(Bytes),
    /// Whatever the decoder encodes the value into.
    Encode,
    /// Nothing, the value is only kept in memory.
    MemoryOnly,
}

/// The hooks a [`LoadService`](super::LoadService) applies to every request.
pub struct LoadPolicy<T> {
    key_filter: Option<KeyFilter>,
    serializer: Option<CacheSerializer<T>>,
    options_processor: Option<OptionsProcessor>,
    should_fetch: Option<ShouldFetch>,
    transformer: Option<Arc<dyn Transformer<T>>>,
}

impl<T> Default for LoadPolicy<T> {
    fn default() -> Self {
        Self {
            key_filter: None,
            serializer: None,
            options_processor: None,
            should_fetch: None,
            transformer: None,
        }
    }
}

impl<T> Clone for LoadPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            key_filter: self.key_filter.clone(),
            serializer: self.serializer.clone(),
            options_processor: self.options_processor.clone(),
            should_fetch: self.should_fetch.clone(),
            transformer: self.transformer.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for LoadPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadPolicy")
            .field("key_filter", &self.key_filter.is_some())
            .field("serializer", &self.serializer.is_some())
            .field("options_processor", &self.options_processor.is_some())
            .field("should_fetch", &self.should_fetch.is_some())
            .field(
                "transformer",
                &self.transformer.as_ref().map(|t| t.cache_key().to_owned()),
            )
            .finish()
    }
}

impl<T: 'static> LoadPolicy<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Locator) -> String + Send + Sync + 'static,
    {
        self.key_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_serializer<F>(mut self, serializer: F) -> Self
    where
        F: Fn(&T, Option<&Bytes>, &Locator) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    pub fn with_options_processor<F>(mut self, processor: F) -> Self
    where
        F: Fn(&Locator, LoadOptions) -> LoadOptions + Send + Sync + 'static,
    {
        self.options_processor = Some(Arc::new(processor));
        self
    }

    pub fn with_should_fetch<F>(mut self, should_fetch: F) -> Self
    where
        F: Fn(&Locator) -> bool + Send + Sync + 'static,
    {
        self.should_fetch = Some(Arc::new(should_fetch));
        self
    }

    pub fn with_transformer(mut self, transformer: impl Transformer<T>) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    pub fn transformer(&self) -> Option<&Arc<dyn Transformer<T>>> {
        self.transformer.as_ref()
    }

    /// The key `locator` is cached under.
    pub fn cache_key_for(&self, locator: &Locator) -> CacheKey {
        let base = match &self.key_filter {
            Some(filter) => CacheKey::new(filter(locator)),
            None => CacheKey::from_locator(locator),
        };
        match &self.transformer {
            Some(transformer) => base.with_suffix(transformer.cache_key()),
            None => base,
        }
    }

    pub fn process_options(&self, locator: &Locator, options: LoadOptions) -> LoadOptions {
        match &self.options_processor {
            Some(processor) => processor(locator, options),
            None => options,
        }
    }

    pub fn allows_fetch(&self, locator: &Locator) -> bool {
        self.should_fetch
            .as_ref()
            .is_none_or(|should_fetch| should_fetch(locator))
    }

    /// Decides what to persist for `value`, which was decoded from `payload`.
    pub(crate) fn persist(&self, value: &T, payload: &Bytes, locator: &Locator) -> Persist {
        match &self.serializer {
            Some(serializer) => match serializer(value, Some(payload), locator) {
                Some(bytes) if !bytes.is_empty() => Persist::Payload(bytes),
                _ => Persist::MemoryOnly,
            },
            // the fetched bytes do not represent a transformed value
            None if self.transformer.is_some() => Persist::Encode,
            None => Persist::Payload(payload.clone()),
        }
    }
}
