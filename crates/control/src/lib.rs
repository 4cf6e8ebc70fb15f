//! Client for the control endpoint that serves the pipeline definition.
//!
//! Workers and the builder call [`ControlClient::fetch_pipeline`] once at
//! start-up. Every attempt that does not yield a valid definition (transport
//! error, non-200 status, unparsable body, failed validation) is retried up
//! to [`FetchPolicy::attempts`] times with exponential backoff; exhaustion is
//! returned as [`ControlError::Exhausted`] and is fatal to the caller.

use std::time::Duration;

use pipeline::{DefinitionError, DefinitionSpec, PipelineDefinition};
use thiserror::Error;
use tracing::{error, info, warn};

/// Path of the pipeline definition on the control endpoint.
pub const PIPELINE_CONFIG_PATH: &str = "/pipeline/config";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("pipeline definition is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("pipeline definition is invalid: {0}")]
    Invalid(#[from] DefinitionError),

    #[error("no valid pipeline definition after {attempts} attempts; last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ControlError>,
    },
}

/// Retry schedule for the definition fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub request_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl FetchPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Parses and validates a definition document.
pub fn parse_definition(body: &[u8]) -> Result<PipelineDefinition, ControlError> {
    let spec: DefinitionSpec = serde_json::from_slice(body)?;
    Ok(PipelineDefinition::new(spec)?)
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    config_url: String,
    policy: FetchPolicy,
}

impl ControlClient {
    pub fn new(base_url: &str, policy: FetchPolicy) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()
            .map_err(ControlError::Client)?;
        Ok(Self {
            http,
            config_url: format!("{}{}", base_url.trim_end_matches('/'), PIPELINE_CONFIG_PATH),
            policy,
        })
    }

    pub fn config_url(&self) -> &str {
        &self.config_url
    }

    async fn fetch_once(&self) -> Result<PipelineDefinition, ControlError> {
        let transport = |source| ControlError::Transport {
            url: self.config_url.clone(),
            source,
        };
        let response = self
            .http
            .get(&self.config_url)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ControlError::Status {
                url: self.config_url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        parse_definition(&body)
    }

    /// Fetches the pipeline definition, retrying per the client's policy.
    pub async fn fetch_pipeline(&self) -> Result<PipelineDefinition, ControlError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_once().await {
                Ok(definition) => {
                    info!(
                        url = %self.config_url,
                        attempt,
                        stages = definition.ordered_stages().len(),
                        "Fetched pipeline definition"
                    );
                    return Ok(definition);
                }
                Err(e) if attempt < attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        url = %self.config_url,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to fetch pipeline definition"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        url = %self.config_url,
                        attempts,
                        error = %e,
                        "Failed to fetch pipeline definition after retries"
                    );
                    return Err(ControlError::Exhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
            }
        }
    }
}
