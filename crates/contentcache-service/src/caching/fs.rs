use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::{Config, DiskCacheConfig, ExpireBasis};

use super::CacheKey;

/// The subdirectory of the cache directory that holds the entries.
pub const CONTENT_DIR: &str = "content";
/// The subdirectory of the cache directory that holds files which are still being written.
pub const TMP_DIR: &str = "tmp";

/// A persistent key to bytes store.
///
/// Every entry is a single file at a path derived from the hash of its key, see
/// [`CacheKey::cache_path`]. Writes go to a temporary file in a sibling directory first, which is
/// then atomically moved into place. A reader thus sees either the previous or the new contents,
/// never a partial write.
///
/// All methods block on file system I/O; the [`ContentCache`](super::ContentCache) runs them on
/// the blocking thread pool. I/O errors never leave this type: they are logged and reported as a
/// miss or as an unconfirmed write.
#[derive(Debug, Clone)]
pub struct DiskTier {
    /// Directory to use for storing cache items.
    pub(super) cache_dir: PathBuf,

    /// Directory to use for temporary files.
    tmp_dir: PathBuf,

    /// Retention settings.
    pub(super) config: DiskCacheConfig,
}

impl DiskTier {
    /// Creates the disk tier in the configured cache directory.
    ///
    /// Returns `None` if no cache directory is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        match &config.cache_dir {
            Some(dir) => Self::new(dir, config.caches.disk).map(Some),
            None => Ok(None),
        }
    }

    /// Creates a disk tier rooted at `base`. The directory will be created if it does not exist.
    pub fn new(base: impl AsRef<Path>, config: DiskCacheConfig) -> io::Result<Self> {
        let base = base.as_ref();
        let cache_dir = base.join(CONTENT_DIR);
        let tmp_dir = base.join(TMP_DIR);

        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            config,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config(&self) -> &DiskCacheConfig {
        &self.config
    }

    /// The location of the entry for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path())
    }

    /// Reads the entry for `key`.
    ///
    /// With [`ExpireBasis::AccessDate`], a successful read bumps the access time of the entry.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let path = self.path_for(key);
        let result = catch_not_found(|| fs::read(&path));
        if let Ok(Some(_)) = result
            && self.config.expire_basis == ExpireBasis::AccessDate
            && let Err(err) = filetime::set_file_atime(&path, FileTime::now())
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to bump access time of `{}`",
                path.display()
            );
        }

        match result {
            Ok(Some(contents)) => {
                tracing::trace!("Disk hit for `{key}` at `{}`", path.display());
                metric!(counter("caches.file.hit") += 1);
                metric!(time_raw("caches.file.size") = contents.len() as u64);
                Some(Bytes::from(contents))
            }
            Ok(None) => {
                metric!(counter("caches.file.miss") += 1);
                None
            }
            Err(err) => {
                log_io_error("Failed to read cache file", &path, &err);
                metric!(counter("caches.file.miss") += 1);
                None
            }
        }
    }

    /// Writes `contents` as the entry for `key`, replacing a previous one.
    ///
    /// Returns whether the write was confirmed.
    pub fn set(&self, key: &CacheKey, contents: &[u8]) -> bool {
        let path = self.path_for(key);
        let result = self.tempfile().and_then(|mut temp_file| {
            temp_file.write_all(contents)?;
            temp_file.flush()?;
            persist_tempfile(temp_file, &path)
        });

        match result {
            Ok(()) => {
                tracing::trace!("Stored `{key}` at `{}`", path.display());
                metric!(counter("caches.file.write") += 1);
                true
            }
            Err(err) => {
                log_io_error("Failed to write cache file", &path, &err);
                false
            }
        }
    }

    /// Removes the entry for `key`, returning whether there was one.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let path = self.path_for(key);
        match catch_not_found(|| fs::remove_file(&path)) {
            Ok(removed) => removed.is_some(),
            Err(err) => {
                log_io_error("Failed to remove cache file", &path, &err);
                false
            }
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Removes all entries.
    pub fn clear(&self) -> bool {
        let result = catch_not_found(|| fs::remove_dir_all(&self.cache_dir))
            .and_then(|_| fs::create_dir_all(&self.cache_dir));
        match result {
            Ok(()) => true,
            Err(err) => {
                log_io_error("Failed to clear cache directory", &self.cache_dir, &err);
                false
            }
        }
    }

    /// Clear the temporary files.
    ///
    /// This should happen on startup, to get rid of temporary files which survived a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    /// The timestamp the age of an entry is measured from.
    pub(super) fn reference_time(&self, metadata: &fs::Metadata) -> io::Result<SystemTime> {
        match self.config.expire_basis {
            ExpireBasis::AccessDate => metadata.accessed(),
            ExpireBasis::ModificationDate => metadata.modified(),
        }
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        // A concurrent `clear_tmp` could remove the directory we are operating in, so retry
        // the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

/// Moves a finished temporary file to its final location, creating parent directories.
///
/// The sweep may remove the parent directories at any time, so this retries once.
fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Err(io::ErrorKind::InvalidInput.into());
    };

    let mut retries = 0;
    loop {
        retries += 1;
        fs::create_dir_all(parent)?;
        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(err) if retries < 2 && err.error.kind() == io::ErrorKind::NotFound => {
                temp_file = err.file;
            }
            Err(err) => return Err(err.error),
        }
    }
}

fn log_io_error(message: &str, path: &Path, error: &io::Error) {
    sentry::with_scope(
        |scope| scope.set_extra("path", path.display().to_string().into()),
        || tracing::error!(error = error as &dyn std::error::Error, "{message}"),
    );
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
