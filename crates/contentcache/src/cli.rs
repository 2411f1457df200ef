//! Exposes the command line application.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result, anyhow};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use url::Url;

use contentcache_service::caching::{self, BytesDecoder, CleanupStats, DiskTier};
use contentcache_service::config::Config;
use contentcache_service::download::{FetchProgress, ProgressFn, SchemeFetcher};
use contentcache_service::metrics;
use contentcache_service::services::{Context, LoadPolicy, LoadResult, Loaded};
use contentcache_service::types::{CacheType, LoadOptions};

use crate::logging;

/// Contentcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load content through the cache and write it to a file or stdout.
    Fetch(FetchArgs),

    /// Sweep the disk cache by age and size.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the number and total size of disk cache entries.
    Stats,
}

#[derive(Debug, clap::Args)]
struct FetchArgs {
    /// The locator to load, an `http`, `https` or `file` URL.
    url: Url,

    /// Write the content to this file instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Fail instead of fetching on a cache miss.
    #[arg(long)]
    cache_only: bool,

    /// Fetch even if the content is cached.
    #[arg(long)]
    refresh: bool,

    /// Fetch even if the locator is blocked because of earlier failures.
    #[arg(long)]
    retry_failed: bool,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(concat!("contentcache@", env!("CARGO_PKG_VERSION")).into()),
        ..Default::default()
    });

    // SAFETY: no other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, hostname);
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Fetch(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("contentcache-worker")
                .enable_all()
                .build()
                .context("failed to start the runtime")?;
            runtime.block_on(fetch(&config, args))?;
        }
        Command::Cleanup { dry_run } => {
            let stats = caching::cleanup(&config, dry_run).context("failed to clean up caches")?;
            print_cleanup(&stats, dry_run);
        }
        Command::Stats => {
            let disk = DiskTier::from_config(&config)
                .context("failed to open the disk cache")?
                .ok_or_else(|| anyhow!("no caching configured"))?;
            let (files, bytes) = disk.calculate_size();
            let summary = serde_json::json!({
                "cache_dir": disk.cache_dir().display().to_string(),
                "files": files,
                "bytes": bytes,
            });
            println!("{summary:#}");
        }
    }

    Ok(())
}

fn print_cleanup(stats: &CleanupStats, dry_run: bool) {
    let summary = serde_json::json!({
        "dry_run": dry_run,
        "removed_files": stats.removed_files,
        "removed_bytes": stats.removed_bytes,
        "removed_dirs": stats.removed_dirs,
        "retained_files": stats.retained_files,
        "retained_bytes": stats.retained_bytes,
    });
    println!("{summary:#}");
}

impl FetchArgs {
    fn options(&self) -> LoadOptions {
        LoadOptions {
            from_cache_only: self.cache_only,
            from_loader_only: self.refresh,
            retry_failed: self.retry_failed,
            ..Default::default()
        }
    }
}

async fn fetch(config: &Config, args: FetchArgs) -> Result<()> {
    let fetcher =
        SchemeFetcher::from_config(&config.fetch).context("failed to create the HTTP client")?;
    let context = Context::from_config(
        config,
        Arc::new(BytesDecoder),
        Arc::new(fetcher),
        LoadPolicy::new(),
        tokio::runtime::Handle::current(),
    )?;

    let progress: ProgressFn = Arc::new(|progress: FetchProgress| match progress.fraction() {
        Some(fraction) => tracing::debug!("Received {:.0}%", fraction * 100.0),
        None => tracing::debug!("Received {} bytes", progress.received),
    });

    let start = Instant::now();
    let (sender, mut results) = tokio::sync::mpsc::unbounded_channel::<LoadResult<Bytes>>();
    let _operation = context.loader.load(
        args.url.clone(),
        args.options(),
        Some(progress),
        move |result| {
            sender.send(result).ok();
        },
    );

    let mut last = None;
    while let Some(result) = results.recv().await {
        let finished = !matches!(&result, Ok(loaded) if !loaded.finished);
        last = Some(result);
        if finished {
            break;
        }
    }
    let loaded = last.ok_or_else(|| anyhow!("the load was cancelled"))??;
    tracing::info!(
        "Loaded `{}` from {} in {}",
        loaded.locator,
        source_of(&loaded),
        humantime::format_duration(start.elapsed())
    );

    match args.output {
        Some(path) => {
            tokio::fs::write(&path, &loaded.value[..])
                .await
                .with_context(|| format!("failed to write `{}`", path.display()))?;
            let summary = serde_json::json!({
                "locator": loaded.locator.as_str(),
                "source": source_of(&loaded),
                "bytes": loaded.value.len(),
                "output": path.display().to_string(),
            });
            println!("{summary:#}");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&loaded.value)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

fn source_of(loaded: &Loaded<Bytes>) -> &'static str {
    match loaded.tier {
        CacheType::None => "fetch",
        tier => tier.as_str(),
    }
}
