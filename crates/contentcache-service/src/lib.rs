//! A tiered content cache with a concurrency-bounded fetch layer.
//!
//! Content is looked up in an in-process [memory tier](caching::MemoryTier), then in a
//! persistent [disk tier](caching::DiskTier), and only fetched through the
//! [`FetchManager`](download::FetchManager) when both miss. The
//! [`LoadService`](services::LoadService) ties these together and hands out a single cancellable
//! [`CombinedOperation`](services::CombinedOperation) per request, and the
//! [`OperationRegistry`](services::OperationRegistry) keeps at most one such operation alive per
//! owner and key.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod services;
pub mod types;
pub mod utils;
