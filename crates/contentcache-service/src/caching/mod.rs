//! The tiered cache.
//!
//! # Tiers
//!
//! Content is cached in up to two tiers:
//!
//! - The [`MemoryTier`] keeps decoded values in process, bounded by count and cost, and evicts the
//!   least recently used ones first.
//! - The [`DiskTier`] keeps the raw bytes in files below the configured cache directory, named by
//!   the hash of their [`CacheKey`], and is swept by age and total size.
//!
//! The [`ContentCache`] composes both behind one interface. Lookups go to memory first and fall
//! back to disk, decoding the bytes with the configured [`Decoder`] and putting the value back into
//! memory. Stores write memory synchronously and disk on the blocking thread pool.
//!
//! # Errors
//!
//! The cache is an optimization and never a source of truth, so I/O errors are logged and then
//! treated as a miss or as a write that did not happen. Callers cannot tell "absent" from "failed
//! to read".

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use sentry::SentryFutureExt;

use crate::config::Config;
use crate::types::{CacheType, LoadOptions};

mod cache_key;
mod cleanup;
mod decoder;
mod fs;
mod memory;

pub use cache_key::{CACHE_VERSION, CacheKey};
pub use cleanup::{CleanupStats, cleanup};
pub use decoder::{BytesDecoder, Decoder};
pub use fs::{CONTENT_DIR, DiskTier, TMP_DIR};
pub use memory::{MemoryEntry, MemoryTier};

/// The result of a [`ContentCache::query`].
#[derive(Debug)]
pub struct CacheQuery<T> {
    pub value: Option<Arc<T>>,
    pub payload: Option<Bytes>,
    /// The tier the value was found in, or [`CacheType::None`] on a miss.
    pub tier: CacheType,
}

impl<T> CacheQuery<T> {
    pub fn miss() -> Self {
        Self {
            value: None,
            payload: None,
            tier: CacheType::None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.value.is_some()
    }
}

/// Memory and disk tier behind one read/write contract.
pub struct ContentCache<T> {
    memory: Option<MemoryTier<T>>,
    disk: Option<Arc<DiskTier>>,
    decoder: Arc<dyn Decoder<T>>,
    /// Runs the blocking disk I/O and decoding.
    runtime: tokio::runtime::Handle,
}

impl<T> std::fmt::Debug for ContentCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("memory entries", &self.memory.as_ref().map(|m| m.count()))
            .field("disk", &self.disk.as_ref().map(|d| d.cache_dir().to_owned()))
            .finish()
    }
}

impl<T: Send + Sync + 'static> ContentCache<T> {
    pub fn new(
        memory: Option<MemoryTier<T>>,
        disk: Option<DiskTier>,
        decoder: Arc<dyn Decoder<T>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            memory,
            disk: disk.map(Arc::new),
            decoder,
            runtime,
        }
    }

    /// Creates the tiers enabled in `config`.
    pub fn from_config(
        config: &Config,
        decoder: Arc<dyn Decoder<T>>,
        runtime: tokio::runtime::Handle,
    ) -> io::Result<Self> {
        let memory = config
            .caches
            .memory
            .enabled
            .then(|| MemoryTier::new(config.caches.memory));
        let disk = DiskTier::from_config(config)?;
        Ok(Self::new(memory, disk, decoder, runtime))
    }

    pub fn memory(&self) -> Option<&MemoryTier<T>> {
        self.memory.as_ref()
    }

    pub fn disk(&self) -> Option<&Arc<DiskTier>> {
        self.disk.as_ref()
    }

    pub fn decoder(&self) -> &Arc<dyn Decoder<T>> {
        &self.decoder
    }

    /// Decodes fetched bytes on the blocking thread pool.
    pub async fn decode(&self, payload: Bytes, key: &CacheKey, options: &LoadOptions) -> Option<T> {
        let decoder = Arc::clone(&self.decoder);
        let key = key.clone();
        let options = options.clone();
        self.runtime
            .spawn_blocking(move || decoder.decode(&payload, &key, &options))
            .await
            .ok()
            .flatten()
    }

    /// Looks up `key` in the memory tier only.
    ///
    /// This never blocks on I/O. An entry that only holds bytes is decoded in place.
    pub fn query_memory(&self, key: &CacheKey, options: &LoadOptions) -> Option<CacheQuery<T>> {
        let memory = self.memory.as_ref()?;
        let entry = memory.get(key)?;

        let value = match entry.value {
            Some(value) => value,
            None => {
                let payload = entry.payload.as_ref()?;
                let value = Arc::new(self.decoder.decode(payload, key, options)?);
                let cost = self.decoder.cost(&value);
                memory.set(
                    key.clone(),
                    MemoryEntry::new(Some(value.clone()), entry.payload.clone(), cost),
                );
                value
            }
        };

        metric!(counter("caches.access") += 1, "hit" => "memory");
        Some(CacheQuery {
            value: Some(value),
            payload: entry.payload,
            tier: CacheType::Memory,
        })
    }

    /// Looks up `key` in the tiers selected by [`LoadOptions::query_tier`].
    ///
    /// Memory is checked first. A disk hit is decoded on the blocking thread pool and put back
    /// into memory.
    pub async fn query(&self, key: &CacheKey, options: &LoadOptions) -> CacheQuery<T> {
        let tier = options.query_tier;

        if tier.includes_memory()
            && let Some(mut hit) = self.query_memory(key, options)
        {
            if options.query_memory_data && hit.payload.is_none() {
                hit.payload = self.read_disk(key).await;
            }
            return hit;
        }

        if !tier.includes_disk() {
            metric!(counter("caches.access") += 1, "hit" => "none");
            return CacheQuery::miss();
        }
        let Some(disk) = self.disk.clone() else {
            metric!(counter("caches.access") += 1, "hit" => "none");
            return CacheQuery::miss();
        };

        let decoder = Arc::clone(&self.decoder);
        let blocking_key = key.clone();
        let options = options.clone();
        let job = self.runtime.spawn_blocking(move || {
            let key = blocking_key;
            let payload = disk.get(&key)?;
            match decoder.decode(&payload, &key, &options) {
                Some(value) => Some((value, payload)),
                None => {
                    tracing::debug!("Failed to decode disk entry for `{key}`");
                    None
                }
            }
        });

        let (value, payload) = match job.await {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                metric!(counter("caches.access") += 1, "hit" => "none");
                return CacheQuery::miss();
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Disk cache lookup failed"
                );
                return CacheQuery::miss();
            }
        };

        let value = Arc::new(value);
        if let Some(memory) = &self.memory {
            let cost = self.decoder.cost(&value);
            memory.set(
                key.clone(),
                MemoryEntry::new(Some(value.clone()), Some(payload.clone()), cost),
            );
        }

        metric!(counter("caches.access") += 1, "hit" => "disk");
        CacheQuery {
            value: Some(value),
            payload: Some(payload),
            tier: CacheType::Disk,
        }
    }

    /// Reads the raw bytes of `key` from disk, without decoding them.
    pub async fn read_disk(&self, key: &CacheKey) -> Option<Bytes> {
        let disk = self.disk.clone()?;
        let key = key.clone();
        self.runtime
            .spawn_blocking(move || disk.get(&key))
            .await
            .ok()
            .flatten()
    }

    /// Stores a value and/or its bytes in the selected tiers.
    ///
    /// The memory tier is written right away. The disk tier receives `payload`, or, if there is
    /// none, whatever [`Decoder::encode`] makes of `value`; empty bytes are never written. The
    /// returned future completes once all selected tiers are written.
    pub async fn store(
        &self,
        value: Option<Arc<T>>,
        payload: Option<Bytes>,
        key: &CacheKey,
        tier: CacheType,
    ) {
        if tier.includes_memory()
            && let Some(memory) = &self.memory
            && (value.is_some() || payload.is_some())
        {
            let cost = match (&value, &payload) {
                (Some(value), _) => self.decoder.cost(value),
                (None, Some(payload)) => payload.len() as u64,
                (None, None) => 0,
            };
            memory.set(
                key.clone(),
                MemoryEntry::new(value.clone(), payload.clone(), cost),
            );
        }

        if tier.includes_disk()
            && let Some(disk) = self.disk.clone()
        {
            let decoder = Arc::clone(&self.decoder);
            let key = key.clone();
            let job = move || {
                let bytes = payload.or_else(|| value.as_deref().and_then(|v| decoder.encode(v)));
                match bytes {
                    Some(bytes) if !bytes.is_empty() => disk.set(&key, &bytes),
                    _ => false,
                }
            };
            let job = self
                .runtime
                .spawn_blocking(job)
                .bind_hub(sentry::Hub::current());
            if let Err(err) = job.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Disk cache write failed"
                );
            }
        }
    }

    /// Removes `key` from the selected tiers.
    pub async fn remove(&self, key: &CacheKey, tier: CacheType) {
        if tier.includes_memory()
            && let Some(memory) = &self.memory
        {
            memory.remove(key);
        }
        if tier.includes_disk()
            && let Some(disk) = self.disk.clone()
        {
            let key = key.clone();
            let _ = self.runtime.spawn_blocking(move || disk.remove(&key)).await;
        }
    }

    /// Returns the first of the selected tiers that holds `key`, memory before disk.
    pub async fn contains(&self, key: &CacheKey, tier: CacheType) -> CacheType {
        if tier.includes_memory()
            && let Some(memory) = &self.memory
            && memory.contains(key)
        {
            return CacheType::Memory;
        }
        if tier.includes_disk()
            && let Some(disk) = self.disk.clone()
        {
            let key = key.clone();
            let found = self
                .runtime
                .spawn_blocking(move || disk.contains(&key))
                .await
                .unwrap_or(false);
            if found {
                return CacheType::Disk;
            }
        }
        CacheType::None
    }

    /// Removes everything from the selected tiers.
    pub async fn clear(&self, tier: CacheType) {
        if tier.includes_memory()
            && let Some(memory) = &self.memory
        {
            memory.clear();
        }
        if tier.includes_disk()
            && let Some(disk) = self.disk.clone()
        {
            let _ = self.runtime.spawn_blocking(move || disk.clear()).await;
        }
    }

    /// Drops all strongly held memory entries.
    pub fn handle_memory_pressure(&self) {
        if let Some(memory) = &self.memory {
            memory.purge();
        }
    }

    /// Counts the disk entries and their total size.
    pub async fn calculate_size(&self) -> (usize, u64) {
        let Some(disk) = self.disk.clone() else {
            return (0, 0);
        };
        self.runtime
            .spawn_blocking(move || disk.calculate_size())
            .await
            .unwrap_or_default()
    }

    /// Sweeps the disk tier by age and size.
    pub async fn cleanup(&self) -> Option<CleanupStats> {
        let disk = self.disk.clone()?;
        match self.runtime.spawn_blocking(move || disk.cleanup(false)).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(err)) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to sweep disk cache"
                );
                None
            }
            Err(_) => None,
        }
    }
}
