//! Rate-limited, retrying HTTP/GraphQL transport to the tracking backend
//! (§4.3, §6). Grafted from the dependency conventions the Sui workspace
//! uses for outbound HTTP (`reqwest` + rustls + `backoff`), since the
//! teacher has no outbound HTTP client of its own.

pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RuncoreError, RuncoreResult};
use rate_limit::{RateLimitTracker, TokenBucket};

/// Everything the transport needs that doesn't change per-request (§6).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub api_key: String,
    pub username: Option<String>,
    pub user_email: Option<String>,
    pub request_timeout: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.wandb.ai".to_string(),
            api_key: String::new(),
            username: None,
            user_email: None,
            request_timeout: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(120),
        }
    }
}

/// A rate-limited `reqwest` client bound to one backend. One instance is
/// shared across every Sender for a process (§5).
pub struct Transport {
    client: reqwest::Client,
    limiter: Arc<TokenBucket>,
    tracker: Arc<RateLimitTracker>,
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig) -> RuncoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RuncoreError::Communication {
                message: format!("failed to build http client: {e}"),
            })?;

        Ok(Self {
            client,
            // Initial 100 req/s, burst 20 (§4.3).
            limiter: Arc::new(TokenBucket::new(100.0, 20.0)),
            tracker: Arc::new(RateLimitTracker::new(50.0, 0.2, 50, 1.0, 100.0)),
            config,
        })
    }

    /// The backend base URL this transport was configured with, for
    /// callers that need to build their own URLs against it (e.g. the
    /// File-Stream endpoint, which isn't a GraphQL call).
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn graphql_url(&self) -> String {
        format!("{}/graphql", self.config.base_url.trim_end_matches('/'))
    }

    fn headers(&self) -> RuncoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.api_key)).map_err(|e| {
                RuncoreError::Communication {
                    message: format!("invalid api key header: {e}"),
                }
            })?,
        );
        if let Some(username) = &self.config.username {
            headers.insert(
                HeaderName::from_static("x-wandb-username"),
                HeaderValue::from_str(username).map_err(|e| RuncoreError::Communication {
                    message: e.to_string(),
                })?,
            );
        }
        if let Some(email) = &self.config.user_email {
            headers.insert(
                HeaderName::from_static("x-wandb-user-email"),
                HeaderValue::from_str(email).map_err(|e| RuncoreError::Communication {
                    message: e.to_string(),
                })?,
            );
        }
        Ok(headers)
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(self.config.max_elapsed_time),
            ..ExponentialBackoff::default()
        }
    }

    /// Execute a GraphQL operation against the backend, retrying transient
    /// failures with exponential backoff and jitter, honoring
    /// `RateLimit-*` and `Retry-After` headers (§4.3, §6).
    pub async fn execute_graphql(&self, query: &str, variables: Value) -> RuncoreResult<Value> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let mut policy = self.backoff_policy();

        loop {
            self.limiter.acquire(None).await?;
            self.tracker.track_request();

            let headers = self.headers()?;
            let send_result = self
                .client
                .post(self.graphql_url())
                .headers(headers)
                .json(&body)
                .send()
                .await;

            let response = match send_result {
                Ok(response) => response,
                Err(e) => {
                    self.retry_or_fail(
                        &mut policy,
                        RuncoreError::Communication {
                            message: e.to_string(),
                        },
                    )
                    .await?;
                    continue;
                }
            };

            self.record_rate_limit_headers(response.headers());

            if let Some(retry_after) = retry_after_duration(response.headers()) {
                warn!(?retry_after, "rate limited, honoring Retry-After");
                tokio::time::sleep(retry_after).await;
                continue;
            }

            let status = response.status();
            if status.is_server_error() {
                let err = RuncoreError::Communication {
                    message: format!("server error {status}"),
                };
                self.retry_or_fail(&mut policy, err).await?;
                continue;
            }
            if !status.is_success() {
                return Err(RuncoreError::Communication {
                    message: format!("http error {status}"),
                });
            }

            let value: Value = response.json().await.map_err(|e| RuncoreError::Communication {
                message: e.to_string(),
            })?;
            if let Some(errors) = value.get("errors") {
                return Err(RuncoreError::GraphQl(errors.to_string()));
            }
            return Ok(value);
        }
    }

    /// Upload raw bytes to a pre-signed or direct-POST URL (§4.6, §4.7).
    pub async fn upload_bytes(&self, url: &str, body: Vec<u8>) -> RuncoreResult<()> {
        let mut policy = self.backoff_policy();
        loop {
            self.limiter.acquire(None).await?;
            self.tracker.track_request();

            let response = self
                .client
                .put(url)
                .body(body.clone())
                .send()
                .await
                .map_err(|e| RuncoreError::Communication {
                    message: e.to_string(),
                });

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    self.retry_or_fail(&mut policy, e).await?;
                    continue;
                }
            };

            self.record_rate_limit_headers(response.headers());
            let status = response.status();
            if status.is_server_error() {
                let err = RuncoreError::Communication {
                    message: format!("server error {status}"),
                };
                self.retry_or_fail(&mut policy, err).await?;
                continue;
            }
            if !status.is_success() {
                return Err(RuncoreError::Communication {
                    message: format!("http error {status}"),
                });
            }
            return Ok(());
        }
    }

    /// POST a JSON body to an arbitrary URL under the same rate limit,
    /// retry and auth policy as `execute_graphql`. Used by the File-Stream
    /// uploader, which posts to a per-run URL rather than the shared
    /// GraphQL endpoint (§4.7).
    pub async fn post_json(&self, url: &str, body: Value) -> RuncoreResult<Value> {
        let mut policy = self.backoff_policy();
        loop {
            self.limiter.acquire(None).await?;
            self.tracker.track_request();

            let headers = self.headers()?;
            let response = self
                .client
                .post(url)
                .headers(headers)
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    self.retry_or_fail(
                        &mut policy,
                        RuncoreError::Communication {
                            message: e.to_string(),
                        },
                    )
                    .await?;
                    continue;
                }
            };

            self.record_rate_limit_headers(response.headers());

            if let Some(retry_after) = retry_after_duration(response.headers()) {
                warn!(?retry_after, "rate limited, honoring Retry-After");
                tokio::time::sleep(retry_after).await;
                continue;
            }

            let status = response.status();
            if status.is_server_error() {
                let err = RuncoreError::Communication {
                    message: format!("server error {status}"),
                };
                self.retry_or_fail(&mut policy, err).await?;
                continue;
            }
            if !status.is_success() {
                return Err(RuncoreError::Communication {
                    message: format!("http error {status}"),
                });
            }

            return response.json().await.map_err(|e| RuncoreError::Communication {
                message: e.to_string(),
            });
        }
    }

    fn record_rate_limit_headers(&self, headers: &HeaderMap) {
        let remaining = headers
            .get("ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok());
        let reset = headers
            .get("ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        if let (Some(remaining), Some(reset)) = (remaining, reset) {
            self.tracker
                .update_estimates(remaining, Duration::from_secs(reset), &self.limiter);
        }
    }

    /// On a retryable error, sleep for the policy's next backoff interval
    /// so the caller can loop and retry; once the policy is exhausted, the
    /// error is returned as permanent (§4.3: "retries with exponential
    /// backoff + jitter via the retrying client").
    async fn retry_or_fail(
        &self,
        policy: &mut ExponentialBackoff,
        err: RuncoreError,
    ) -> RuncoreResult<()> {
        match policy.next_backoff() {
            Some(delay) => {
                debug!(?delay, error = %err, "retrying after transient transport error");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(err),
        }
    }
}

fn retry_after_duration(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_parses_integer_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(retry_after_duration(&headers), Some(Duration::from_secs(5)));
    }

    #[test]
    fn retry_after_absent_is_none() {
        let headers = HeaderMap::new();
        assert_eq!(retry_after_duration(&headers), None);
    }
}
