//! Support to fetch from the local file system.
//!
//! This allows content to be loaded from `file://` locators, usually only used for testing.

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::types::Locator;

use super::{FetchError, FetchResult, Fetcher, Progress};

/// Fetcher implementation for `file` locators.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemFetcher;

impl FilesystemFetcher {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_file(&self, locator: &Locator, progress: Progress) -> FetchResult {
        let path = locator
            .to_file_path()
            .map_err(|_| FetchError::InvalidLocator(format!("not a local file: `{locator}`")))?;
        tracing::debug!("Fetching file from {:?}", path);

        let contents = tokio::fs::read(&path).await?;
        let len = contents.len() as u64;
        progress.report(len, Some(len));
        Ok(Bytes::from(contents))
    }
}

impl Fetcher for FilesystemFetcher {
    fn fetch<'a>(&'a self, locator: &'a Locator, progress: Progress) -> BoxFuture<'a, FetchResult> {
        Box::pin(self.fetch_file(locator, progress))
    }
}
