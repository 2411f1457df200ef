use std::error::Error;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::Locator;

/// An error that happens when fetching content.
///
/// A single fetch may be shared by several requests, so this error is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The content does not exist at the locator.
    #[error("not found")]
    NotFound,
    /// The content could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The fetch did not complete within the configured timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch failed due to another problem, like connection loss, DNS resolution, or a 5xx
    /// server response.
    #[error("fetch failed: {0}")]
    Transport(String),
    /// The locator is blocked because of earlier terminal failures.
    #[error("blocked: {0}")]
    Blocked(String),
    /// A cache miss for a request that is not allowed to fetch.
    #[error("not found in cache and fetching is not allowed")]
    NotAllowed,
    /// The content was fetched, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The request was cancelled by its caller.
    #[error("cancelled")]
    Cancelled,
    /// The locator cannot be handled by any fetcher.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for FetchError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::from_std_error(err),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_builder() {
            return Self::InvalidLocator(error.to_string());
        }
        Self::transport_error(&error)
    }
}

impl FetchError {
    /// Logs an unexpected error and turns it into [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Creates a [`Transport`](Self::Transport) error from the innermost source of `error`.
    pub(crate) fn transport_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Transport(error_string)
    }

    /// Whether this error is expected to repeat on every retry of the same locator.
    ///
    /// Terminal failures count towards blocking a locator, transient ones do not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::PermissionDenied(_) | Self::InvalidLocator(_) | Self::Malformed(_)
        )
    }

    /// A short tag for metrics.
    pub fn as_status(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Blocked(_) => "blocked",
            Self::NotAllowed => "notallowed",
            Self::Malformed(_) => "malformed",
            Self::Cancelled => "cancelled",
            Self::InvalidLocator(_) => "invalidlocator",
            Self::InternalError => "internalerror",
        }
    }
}

/// A failed load, attributed to the locator it was requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub locator: Locator,
    pub error: FetchError,
}

impl LoadError {
    pub fn new(locator: Locator, error: FetchError) -> Self {
        Self { locator, error }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == FetchError::Cancelled
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to load `{}`: {}", self.locator, self.error)
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}
