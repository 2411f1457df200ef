use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::Locator;

/// Layout version of the on-disk cache paths.
///
/// Bumping this moves all entries to a fresh directory; the sweep removes the old ones.
pub const CACHE_VERSION: u32 = 1;

/// The identity of a cache entry.
///
/// A key is a string derived deterministically from a [`Locator`]. It is used as-is by the
/// memory tier, while the disk tier stores entries at a path derived from the key's hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// The default key for a locator: its canonical string form.
    pub fn from_locator(locator: &Locator) -> Self {
        Self::new(locator.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creates the key of a derived entry, like a transformed version of this one.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(format!("{}-{suffix}", self.0))
    }

    /// The sha-256 hash of the key.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.0.as_bytes()).into()
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let hash = self.digest();
        let mut path = format!("v{CACHE_VERSION}/{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}
