//! HTTP client for the remote option endpoints.

use aid_proto::config::ApiConfig;
use aid_proto::protocol::{parse_envelope, EnvelopeError, OptionItem, OptionKind, API_KEY_HEADER};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

impl ApiError {
    fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout {
                url: url.to_string(),
            }
        } else {
            ApiError::Transport {
                url: url.to_string(),
                source: e,
            }
        }
    }
}

/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct OptionsClient {
    http: reqwest::Client,
}

impl OptionsClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(ApiError::Build)?;
        Ok(Self { http })
    }

    /// `GET {endpoint}/sd_params/options/{kind}` with the key header.
    pub async fn fetch_options(
        &self,
        kind: OptionKind,
        endpoint: &str,
        api_key: &str,
    ) -> Result<Vec<OptionItem>, ApiError> {
        let url = kind.url(endpoint);
        debug!("fetching {} options from {}", kind, url);

        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { url, status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::from_reqwest(&url, e))?;
        let items: Vec<OptionItem> = parse_envelope(&body)?;
        debug!("{} {} option(s) from {}", items.len(), kind, url);
        Ok(items)
    }
}
