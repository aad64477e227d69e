use std::time::Duration;

use reqwest::{Url, redirect};

use crate::config::Config;

/// Various timeouts for photo downloads.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            max_download: Duration::from_secs(30),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and download timeouts.
/// * `user_agent` is sent with every request.
/// * Follows at most 5 redirects, photo hosts commonly bounce to a CDN once or twice.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    user_agent: &str,
) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(user_agent)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(5))
        .build()
}

/// Rewrites a plain `http` URL to `https`. Other schemes are left alone.
pub fn upgrade_to_https(mut url: Url) -> Url {
    if url.scheme() == "http" {
        // switching between two special schemes cannot fail
        let _ = url.set_scheme("https");
    }
    url
}
