use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use crate::config::FetchConfig;
use crate::types::Locator;

use super::FetchError;

/// Upper bound of locators with recorded failures that are remembered at once.
const MAX_TRACKED_FAILURES: u64 = 100_000;

/// Upper bound of locators that are blocked at once.
const MAX_BLOCKED: u64 = 100_000;

/// Keeps track of fetch failures and blocks locators accordingly.
///
/// A locator is blocked once `threshold` terminal failures were registered for it. It stays
/// blocked for `block_time`, or until it is [removed](Self::remove) if no block time is
/// configured. A successful fetch also removes the locator.
#[derive(Clone, Debug)]
pub(crate) struct Blocklist {
    threshold: usize,
    block_time: Option<Duration>,
    failures: moka::sync::Cache<Locator, Arc<AtomicUsize>>,
    blocked: moka::sync::Cache<Locator, FetchError>,
}

impl Blocklist {
    pub fn from_config(config: &FetchConfig) -> Self {
        let mut blocked = moka::sync::Cache::builder()
            .max_capacity(MAX_BLOCKED)
            .eviction_listener(|locator: Arc<Locator>, _, _| {
                tracing::info!(%locator, "Unblocking locator")
            });
        if let Some(block_time) = config.blocklist_block_time {
            blocked = blocked.time_to_live(block_time);
        }

        Self {
            threshold: config.blocklist_threshold(),
            block_time: config.blocklist_block_time,
            failures: moka::sync::Cache::builder()
                .max_capacity(MAX_TRACKED_FAILURES)
                .build(),
            blocked: blocked.build(),
        }
    }

    /// Registers a failure for `locator`.
    ///
    /// Returns `true` if that puts the locator over the threshold and it is now blocked.
    pub fn register_failure(&self, locator: &Locator, error: &FetchError) -> bool {
        // Several coalesced or concurrent fetches may fail around the same time.
        if self.blocked.contains_key(locator) {
            return false;
        }

        tracing::trace!(
            %locator,
            time = %humantime::format_rfc3339(SystemTime::now()),
            %error,
            "Registering fetch failure"
        );

        let entry = self.failures.entry_by_ref(locator).or_default();
        let failures = entry.value().fetch_add(1, Ordering::Relaxed) + 1;

        if failures < self.threshold {
            return false;
        }

        tracing::info!(
            %locator,
            failures,
            %error,
            "Blocking locator due to too many fetch failures"
        );
        self.failures.invalidate(locator);
        self.blocked.insert(locator.clone(), error.clone());
        metric!(gauge("fetch.blocklist.size") = self.blocked.entry_count());
        true
    }

    /// If the given locator is blocked, this returns the error that caused the block.
    pub fn is_blocked(&self, locator: &Locator) -> Option<FetchError> {
        self.blocked.get(locator)
    }

    /// Creates the [`FetchError::Blocked`] returned for a blocked `locator`.
    pub fn format_error(&self, locator: &Locator, reason: &FetchError) -> FetchError {
        let duration = match self.block_time {
            Some(block_time) => format!(
                "It will remain blocked for a maximum of {}.",
                humantime::format_duration(block_time)
            ),
            None => "It will remain blocked until it is removed.".to_owned(),
        };
        FetchError::Blocked(format!(
            "`{locator}` is blocked because of earlier fetch failures. {duration} The error that triggered the block was: `{reason}`."
        ))
    }

    /// Forgets all failures of `locator` and unblocks it.
    pub fn remove(&self, locator: &Locator) {
        self.failures.invalidate(locator);
        self.blocked.invalidate(locator);
    }

    pub fn clear(&self) {
        self.failures.invalidate_all();
        self.blocked.invalidate_all();
    }
}
