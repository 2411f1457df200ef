//! Support to fetch from HTTP servers.

use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};

use crate::config::FetchConfig;
use crate::types::Locator;
use crate::utils::http::create_client;

use super::{FetchError, FetchResult, Fetcher, Progress};

/// Fetcher implementation for `http` and `https` locators.
///
/// The body is streamed, and every received chunk is reported as progress.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self::new(create_client(config)?))
    }

    async fn fetch_url(&self, locator: &Locator, progress: Progress) -> FetchResult {
        tracing::debug!("Fetching `{locator}`");

        let response = self.client.get(locator.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_from_status(locator, status));
        }

        let expected = response.content_length();
        let capacity = expected.unwrap_or_default().min(MAX_PREALLOCATION) as usize;
        let mut body = Vec::with_capacity(capacity);
        progress.report(0, expected);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await.transpose()? {
            body.extend_from_slice(&chunk);
            progress.report(body.len() as u64, expected);
        }

        tracing::trace!("Success hitting `{locator}`");
        Ok(Bytes::from(body))
    }
}

/// Upper bound for allocating the body buffer up front, based on the announced length.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Infers the [`FetchError`] from an unsuccessful status code.
fn error_from_status(locator: &Locator, status: StatusCode) -> FetchError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to fetch `{locator}`: {status}");
        FetchError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{locator}`: {status}");
        FetchError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{locator}`: {status}");
        FetchError::Transport(status.to_string())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, locator: &'a Locator, progress: Progress) -> BoxFuture<'a, FetchResult> {
        Box::pin(self.fetch_url(locator, progress))
    }
}
