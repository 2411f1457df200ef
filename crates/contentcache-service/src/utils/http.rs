use std::time::Duration;

use reqwest::redirect;

use crate::config::FetchConfig;
use crate::download::FetchError;

/// The maximum number of redirects followed for one fetch.
const MAX_REDIRECTS: usize = 10;

/// Creates a [`reqwest::Client`] for fetching content.
///
/// Connection and overall timeouts come from the [`FetchConfig`]. The fetch manager enforces its
/// own timeout on top of this; the client timeout only guards against a hung transport that
/// outlives its task.
pub fn create_client(config: &FetchConfig) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(config.user_agent.as_str())
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .build()?;

    Ok(client)
}
