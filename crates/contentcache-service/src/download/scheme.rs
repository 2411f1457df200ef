use futures::FutureExt;
use futures::future::BoxFuture;

use crate::config::FetchConfig;
use crate::types::Locator;

use super::{FetchError, FetchResult, Fetcher, FilesystemFetcher, HttpFetcher, Progress};

/// Dispatches each locator to the fetcher for its URL scheme.
#[derive(Debug, Clone)]
pub struct SchemeFetcher {
    http: HttpFetcher,
    fs: FilesystemFetcher,
}

impl SchemeFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            fs: FilesystemFetcher,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self::new(HttpFetcher::from_config(config)?))
    }
}

impl Fetcher for SchemeFetcher {
    fn fetch<'a>(&'a self, locator: &'a Locator, progress: Progress) -> BoxFuture<'a, FetchResult> {
        match locator.scheme() {
            "http" | "https" => self.http.fetch(locator, progress),
            "file" => self.fs.fetch(locator, progress),
            scheme => {
                let error = FetchError::InvalidLocator(format!("unsupported scheme `{scheme}`"));
                async move { Err(error) }.boxed()
            }
        }
    }
}
