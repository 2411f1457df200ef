use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "contentcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which file timestamp the disk tier uses to compute the age of an entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireBasis {
    /// The last time the entry was read.
    AccessDate,
    /// The last time the entry was written.
    #[default]
    ModificationDate,
}

/// Limits of the in-process memory tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Whether decoded values are kept in memory at all.
    pub enabled: bool,
    /// Keeps a weak index of values that are still referenced elsewhere, so they survive a purge.
    pub weak_secondary: bool,
    /// Maximum total cost of all entries. `0` means unlimited.
    pub max_cost: u64,
    /// Maximum number of entries. `0` means unlimited.
    pub max_count: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weak_secondary: true,
            max_cost: 0,
            max_count: 0,
        }
    }
}

/// Retention of the persistent disk tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Maximum age of an entry, measured from its [`ExpireBasis`] timestamp.
    ///
    /// `None` disables age based expiry, while `0s` removes every entry on the next sweep.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// Maximum total size in bytes. `0` means unlimited.
    pub max_size: u64,
    pub expire_basis: ExpireBasis,
    /// How often the background maintenance sweeps the disk tier. `None` or `0s` disables it.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(3600 * 24 * 7)),
            max_size: 0,
            expire_basis: ExpireBasis::ModificationDate,
            sweep_interval: Some(Duration::from_secs(3600)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    pub memory: MemoryCacheConfig,
    pub disk: DiskCacheConfig,
}

/// The order in which queued fetches of the same priority are started.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionOrder {
    /// Oldest submission first.
    #[default]
    Fifo,
    /// Newest submission first.
    Lifo,
}

/// Configuration of the fetch layer.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Number of fetches that may run at the same time.
    pub max_concurrent: usize,
    /// Upper limit for a single fetch, including queueing inside the transport.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Minimum progress delta, as a fraction in `[0, 1]`, between two progress notifications.
    pub minimum_progress_interval: f64,
    pub admission_order: AdmissionOrder,
    /// Number of terminal failures after which a locator is blocked.
    pub blocklist_threshold: usize,
    /// How long a locator stays blocked. `None` keeps it blocked until it is removed explicitly.
    #[serde(with = "humantime_serde")]
    pub blocklist_block_time: Option<Duration>,
    pub user_agent: String,
}

impl FetchConfig {
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.max(1)
    }

    pub fn minimum_progress_interval(&self) -> f64 {
        if self.minimum_progress_interval.is_nan() {
            return 0.0;
        }
        self.minimum_progress_interval.clamp(0.0, 1.0)
    }

    pub fn blocklist_threshold(&self) -> usize {
        self.blocklist_threshold.max(1)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            minimum_progress_interval: 0.0,
            admission_order: AdmissionOrder::Fifo,
            blocklist_threshold: 1,
            blocklist_block_time: None,
            user_agent: concat!("contentcache/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the disk tier. Default is not to persist anything.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Limits and retention of both cache tiers.
    pub caches: CacheConfigs,

    /// Concurrency, timeouts and failure handling of fetches.
    pub fetch: FetchConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
