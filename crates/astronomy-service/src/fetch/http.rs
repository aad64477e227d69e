//! Support to fetch photos from HTTP hosts.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use reqwest::{Client, StatusCode, Url};

use crate::config::Config;
use crate::utils::futures::{m, measure};
use crate::utils::http::{DownloadTimeouts, create_client, upgrade_to_https};

use super::{FetchError, FetchResult, Fetcher};

/// Fetcher implementation that downloads photos over HTTP.
///
/// Photo locations come from the catalog and are fixed at construction time. Keys without a
/// known location resolve to [`FetchError::NotFound`] without touching the network.
pub struct HttpFetcher<K> {
    client: Client,
    locations: Arc<HashMap<K, Url>>,
    timeouts: DownloadTimeouts,
    force_https: bool,
}

impl<K> fmt::Debug for HttpFetcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("locations", &self.locations.len())
            .field("timeouts", &self.timeouts)
            .field("force_https", &self.force_https)
            .finish()
    }
}

impl<K: Eq + Hash> HttpFetcher<K> {
    pub fn new(
        client: Client,
        locations: impl IntoIterator<Item = (K, Url)>,
        timeouts: DownloadTimeouts,
        force_https: bool,
    ) -> Self {
        Self {
            client,
            locations: Arc::new(locations.into_iter().collect()),
            timeouts,
            force_https,
        }
    }

    /// Creates a fetcher with a client configured from `config`.
    pub fn from_config(
        config: &Config,
        locations: impl IntoIterator<Item = (K, Url)>,
    ) -> reqwest::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts, &config.user_agent)?;
        Ok(Self::new(client, locations, timeouts, config.force_https))
    }

    /// The URL the photo for `key` is downloaded from.
    pub fn location(&self, key: &K) -> Option<Url> {
        let url = self.locations.get(key)?.clone();
        Some(match self.force_https {
            true => upgrade_to_https(url),
            false => url,
        })
    }
}

impl<K> Fetcher<K> for HttpFetcher<K>
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn fetch(&self, key: K) -> BoxFuture<'static, FetchResult> {
        let Some(url) = self.location(&key) else {
            tracing::debug!(?key, "No location known for photo");
            return future::ready(Err(FetchError::NotFound)).boxed();
        };

        let client = self.client.clone();
        let timeout = self.timeouts.max_download;

        async move {
            tracing::debug!("Fetching photo from `{}`", url);

            let job = tokio::time::timeout(timeout, download(client, url.clone(), timeout));
            let result = match measure("service.download", m::timed_result, job).await {
                Err(_) => Err(FetchError::Timeout(timeout)),
                Ok(result) => result,
            };

            match &result {
                Ok(payload) => {
                    metric!(time_raw("service.download.size") = payload.len() as u64);
                    tracing::debug!("Photo `{}` fetched successfully", url);
                }
                Err(error) => {
                    tracing::debug!(
                        error = error as &dyn std::error::Error,
                        "Photo `{}` fetching failed",
                        url
                    );
                }
            }
            result
        }
        .boxed()
    }
}

async fn download(client: Client, url: Url, timeout: Duration) -> FetchResult {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|error| request_error(error, timeout))?;

    match response.status() {
        status if status.is_success() => response
            .bytes()
            .await
            .map_err(|error| request_error(error, timeout)),
        StatusCode::NOT_FOUND => Err(FetchError::NotFound),
        status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
            Err(FetchError::PermissionDenied(status.to_string()))
        }
        status => Err(FetchError::DownloadError(status.to_string())),
    }
}

/// The client enforces the same overall timeout, so its timeouts are reported as such.
fn request_error(error: reqwest::Error, timeout: Duration) -> FetchError {
    match error.is_timeout() {
        true => FetchError::Timeout(timeout),
        false => error.into(),
    }
}
