use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};
use sentry::SentryFutureExt;
use tokio::task::JoinHandle;

use crate::config::Config;

use super::DiskTier;
use super::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// This sweeps the disk tier based on the configured retention.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<CleanupStats> {
    let disk = DiskTier::from_config(config)?.ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;
    Ok(disk.cleanup(dry_run)?)
}

/// The outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// A file found while walking the cache directory.
#[derive(Debug)]
struct SweepEntry {
    path: PathBuf,
    size: u64,
    reference_time: SystemTime,
}

impl DiskTier {
    /// Sweeps this tier based on the configured retention.
    ///
    /// First every entry older than [`max_age`](crate::config::DiskCacheConfig::max_age) is
    /// removed. If the remaining entries are still larger than
    /// [`max_size`](crate::config::DiskCacheConfig::max_size), entries are removed oldest first
    /// until they fit. Directories left empty are removed as well.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> io::Result<CleanupStats> {
        tracing::info!("Cleaning up `{}`", self.cache_dir.display());
        let now = SystemTime::now();

        let mut entries = Vec::new();
        self.collect_entries(&self.cache_dir, &mut entries)?;

        let mut stats = CleanupStats::default();
        let mut retained = Vec::with_capacity(entries.len());
        for entry in entries {
            let age = now
                .duration_since(entry.reference_time)
                .unwrap_or_default();
            if is_expired(self.config.max_age, age) {
                self.remove_entry(&entry, &mut stats, dry_run);
            } else {
                retained.push(entry);
            }
        }

        let mut total_bytes: u64 = retained.iter().map(|e| e.size).sum();
        if self.config.max_size > 0 && total_bytes > self.config.max_size {
            // oldest first, ties broken by path for a stable order
            retained.sort_by(|a, b| {
                a.reference_time
                    .cmp(&b.reference_time)
                    .then_with(|| a.path.cmp(&b.path))
            });
            let mut overflow = retained.len();
            for (idx, entry) in retained.iter().enumerate() {
                if total_bytes <= self.config.max_size {
                    overflow = idx;
                    break;
                }
                self.remove_entry(entry, &mut stats, dry_run);
                total_bytes -= entry.size;
            }
            retained.drain(..overflow);
        }

        stats.retained_files = retained.len();
        stats.retained_bytes = retained.iter().map(|e| e.size).sum();

        if !dry_run {
            self.remove_empty_dirs(&self.cache_dir, &mut stats)?;
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }

    /// Counts the entries and their total size in bytes.
    pub fn calculate_size(&self) -> (usize, u64) {
        let mut entries = Vec::new();
        if let Err(err) = self.collect_entries(&self.cache_dir, &mut entries) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to calculate cache size"
            );
        }
        (entries.len(), entries.iter().map(|e| e.size).sum())
    }

    /// Spawns a task that sweeps this tier every `interval` on the blocking pool.
    ///
    /// A zero `interval` disables the sweep, and the returned task finishes right away.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        interval: Duration,
    ) -> JoinHandle<()> {
        let disk = Arc::clone(self);
        let blocking = runtime.clone();
        let task = async move {
            if interval.is_zero() {
                tracing::warn!("Disk cache sweep interval is zero, not sweeping");
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let disk = Arc::clone(&disk);
                match blocking.spawn_blocking(move || disk.cleanup(false)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Failed to sweep disk cache"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Disk cache sweep panicked"
                        );
                    }
                }
            }
        };
        runtime.spawn(task.bind_hub(sentry::Hub::current()))
    }

    /// Recursively collects all files below `directory`.
    fn collect_entries(&self, directory: &Path, entries: &mut Vec<SweepEntry>) -> io::Result<()> {
        let dir = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(());
            }
        };
        tracing::debug!("Sweeping directory `{}`", directory.display());

        for entry in dir {
            let path = entry?.path();
            let Some(metadata) = catch_not_found(|| path.metadata())? else {
                continue;
            };
            if metadata.is_dir() {
                self.collect_entries(&path, entries)?;
            } else {
                let reference_time = self.reference_time(&metadata)?;
                entries.push(SweepEntry {
                    path,
                    size: metadata.len(),
                    reference_time,
                });
            }
        }

        Ok(())
    }

    fn remove_entry(&self, entry: &SweepEntry, stats: &mut CleanupStats, dry_run: bool) {
        tracing::debug!("Removing file `{}`", entry.path.display());
        if !dry_run && let Err(e) = catch_not_found(|| remove_file(&entry.path)) {
            sentry::with_scope(
                |scope| scope.set_extra("path", entry.path.display().to_string().into()),
                || tracing::error!("Failed to clean cache file: {:?}", e),
            );
            return;
        }
        stats.removed_files += 1;
        stats.removed_bytes += entry.size;
    }

    /// Removes empty directories below `directory`, returning `true` if it is empty itself.
    fn remove_empty_dirs(&self, directory: &Path, stats: &mut CleanupStats) -> io::Result<bool> {
        let Some(dir) = catch_not_found(|| read_dir(directory))? else {
            return Ok(true);
        };

        let mut is_empty = true;
        for entry in dir {
            let path = entry?.path();
            if !path.is_dir() {
                is_empty = false;
                continue;
            }
            let mut dir_is_empty = self.remove_empty_dirs(&path, stats)?;
            if dir_is_empty {
                tracing::debug!("Removing directory `{}`", path.display());
                if let Err(e) = catch_not_found(|| remove_dir(&path)) {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to clean cache directory: {:?}", e),
                    );
                    dir_is_empty = false;
                } else {
                    stats.removed_dirs += 1;
                }
            }
            is_empty &= dir_is_empty;
        }

        Ok(is_empty)
    }
}

/// Whether an entry of the given age is past `max_age`.
///
/// `None` never expires anything, while a zero `max_age` expires everything.
fn is_expired(max_age: Option<Duration>, age: Duration) -> bool {
    match max_age {
        None => false,
        Some(max_age) => max_age.is_zero() || age > max_age,
    }
}
