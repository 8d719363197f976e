//! Client used by web API routes to obtain a fresh token from the bridge.
//!
//! Every failure comes back as a [`BridgeError`]; the caller decides what
//! to show. There are no retries here.

use std::time::Duration;

use crate::config::{bridge_url_from_env, BridgeConfig};
use crate::error::{BridgeError, Result};
use crate::relay::{ApiError, BridgeStatus, FreshTokenResponse};

/// Default request timeout, longer than the bridge's fresh timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Slack added to the bridge's fresh timeout by [`FreshTokenClient::from_config`]
const TIMEOUT_MARGIN: Duration = Duration::from_secs(4);

pub struct FreshTokenClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl FreshTokenClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Client for `RECAPTCHA_BRIDGE_URL` with the default timeout
    pub fn from_env() -> Result<Self> {
        Self::new(bridge_url_from_env(), DEFAULT_TIMEOUT)
    }

    /// Client for a bridge running with `config` in this process or on this host
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Self::new(
            format!("http://{}", config.http_addr()),
            config.fresh_timeout + TIMEOUT_MARGIN,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn fetch_fresh(&self) -> Result<FreshTokenResponse> {
        self.get_json("/recaptcha/fresh").await
    }

    pub async fn status(&self) -> Result<BridgeStatus> {
        self.get_json("/status").await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http_client.get(&url).send().await.map_err(|e| {
            log::warn!("Token bridge unreachable at {}: {}", url, e);
            if e.is_timeout() {
                BridgeError::timeout(format!("request to {} timed out", url))
            } else {
                BridgeError::network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| BridgeError::network(format!("Invalid response body: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ApiError>(&body) {
            Ok(api_error) => BridgeError::from_code(&api_error.code, &api_error.error),
            Err(_) => BridgeError::network(format!("HTTP {}: {}", status, body)),
        })
    }
}
