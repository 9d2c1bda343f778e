//! Client for the cluster discovery service.

use std::time::Duration;

use super::PlatformError;

/// Public discovery service used when no other base URL is configured.
pub const DEFAULT_DISCOVERY_URL: &str = "https://discovery.etcd.io";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests fresh coordination endpoints from a discovery service.
///
/// Each call is a single `GET <base>/new?size=<n>`; there is no retry.
#[derive(Clone, Debug)]
pub struct DiscoveryClient {
    client: reqwest::Client,
    base_url: String,
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_URL)
    }
}

impl DiscoveryClient {
    /// Creates a client for the service at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Base URL of the discovery service.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Requests an endpoint for a cluster of `size` members.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Discovery`] on transport failure, a
    /// non-success status, or an empty response body.
    pub async fn new_endpoint(&self, size: usize) -> Result<String, PlatformError> {
        let url = format!("{}/new", self.base_url);
        tracing::debug!(%url, size, "requesting discovery endpoint");
        let response = self
            .client
            .get(&url)
            .query(&[("size", size)])
            .send()
            .await
            .map_err(discovery_error)?;

        let status = response.status();
        let body = response.text().await.map_err(discovery_error)?;
        if !status.is_success() {
            return Err(PlatformError::Discovery {
                message: format!("{url} returned {status}: {}", body.trim()),
            });
        }

        let endpoint = body.trim();
        if endpoint.is_empty() {
            return Err(PlatformError::Discovery {
                message: format!("{url} returned an empty body"),
            });
        }
        Ok(endpoint.to_owned())
    }
}

fn discovery_error(err: reqwest::Error) -> PlatformError {
    PlatformError::Discovery {
        message: err.to_string(),
    }
}
