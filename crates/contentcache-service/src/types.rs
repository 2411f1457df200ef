//! Types shared between the cache, the fetch layer and the load orchestrator.

use serde::{Deserialize, Serialize};

/// The resource locator content is loaded from.
pub type Locator = url::Url;

/// Selects the cache tiers an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// No tier at all.
    None,
    /// Only the in-process memory tier.
    Memory,
    /// Only the persistent disk tier.
    Disk,
    /// Both tiers.
    #[default]
    All,
}

impl CacheType {
    pub fn includes_memory(self) -> bool {
        matches!(self, Self::Memory | Self::All)
    }

    pub fn includes_disk(self) -> bool {
        matches!(self, Self::Disk | Self::All)
    }

    /// Returns the same selection with the disk tier removed.
    pub fn without_disk(self) -> Self {
        match self {
            Self::All | Self::Memory => Self::Memory,
            Self::Disk | Self::None => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::All => "all",
        }
    }
}

/// Admission priority of a fetch.
///
/// Higher priorities are always admitted before lower ones. Within one priority the configured
/// [`AdmissionOrder`](crate::config::AdmissionOrder) applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub(crate) const ALL_DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Per-request options.
///
/// These can be rewritten per locator by an
/// [`OptionsProcessor`](crate::services::OptionsProcessor) before the cache is queried.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadOptions {
    /// Never fetch on a cache miss.
    pub from_cache_only: bool,
    /// Skip the cache lookup and always fetch.
    pub from_loader_only: bool,
    /// Deliver a cached value, and then fetch and deliver the fresh one as well.
    pub refresh_cached: bool,
    /// Fetch even if the locator is currently blocked because of earlier failures.
    pub retry_failed: bool,
    /// On a memory hit, read the payload from the disk tier too.
    pub query_memory_data: bool,
    /// Deliver one [`Cancelled`](crate::download::FetchError::Cancelled) result when the
    /// operation is cancelled.
    pub report_cancellation: bool,
    pub priority: Priority,
    /// The tiers consulted on lookup.
    pub query_tier: CacheType,
    /// The tiers that receive a fetched result.
    pub store_tier: CacheType,
}
