use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ExtractError;
use crate::config::HttpConfig;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.backoff_base(),
            ..Self::default()
        }
    }

    /// No retries, for tests and probes that must fail fast.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped, plus up to half of that again as jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ms = (exp.as_millis() as u64) / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Decoded reply to a GET
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub body: T,
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(config: &HttpConfig) -> Result<Self, ExtractError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ExtractError::Http {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            http,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// GET `url` and decode the body as JSON.
    pub async fn get_json(
        &self,
        url: &str,
        params: &Map<String, Value>,
        headers: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse<Value>, ExtractError> {
        let response = self.send(url, params, headers, timeout).await?;
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| ExtractError::shape(url, format!("body is not JSON: {e}")))?;
        Ok(ApiResponse { status, body })
    }

    /// GET `url` and return the raw body.
    pub async fn get_bytes(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse<Vec<u8>>, ExtractError> {
        let response = self.send(url, &Map::new(), headers, timeout).await?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|source| ExtractError::Http {
                url: url.to_string(),
                source,
            })?
            .to_vec();
        Ok(ApiResponse { status, body })
    }

    async fn send(
        &self,
        url: &str,
        params: &Map<String, Value>,
        headers: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ExtractError> {
        let query: Vec<(&str, String)> = params
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.as_str(), value)
            })
            .collect();

        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut request = self.http.get(url).query(&query);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            debug!(url, attempt, "GET");
            let error = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let error = ExtractError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    };
                    if !retryable_status(status) {
                        return Err(error);
                    }
                    error
                },
                Err(source) => {
                    let retry = retryable_error(&source);
                    let error = ExtractError::Http {
                        url: url.to_string(),
                        source,
                    };
                    if !retry {
                        return Err(error);
                    }
                    error
                },
            };

            if attempt >= attempts {
                return Err(error);
            }

            let delay = self.retry.delay_for(attempt);
            warn!("Request attempt {}/{} failed: {}", attempt, attempts, error);
            info!("Retrying in {:?}...", delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = policy.delay_for(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        let capped = policy.delay_for(10);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(450));
    }

    #[test]
    fn test_no_retry_policy_has_no_delay() {
        assert_eq!(RetryPolicy::none().delay_for(1), Duration::ZERO);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
        assert!(!retryable_status(StatusCode::UNAUTHORIZED));
    }
}
