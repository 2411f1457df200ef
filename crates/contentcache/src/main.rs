//! Contentcache.
//!
//! A command line front end to the tiered content cache. It loads content through the memory and
//! disk tiers, fetching it over HTTP or from the file system on a miss, and maintains the disk
//! cache.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
