//! Long-lived HTTP session with bounded retry on transient failures.

use reqwest::{header::RETRY_AFTER, Client, Method, Request, RequestBuilder, Response};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{GraphError, GraphResult};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for a single backoff sleep, in seconds.
const BACKOFF_MAX_SECONDS: f64 = 120.0;

/// When and how often a request is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Status codes that trigger a retry.
    pub status_forcelist: Vec<u16>,
    /// Seconds; retry `i` waits `backoff_factor * 2^i`.
    pub backoff_factor: f64,
    /// Fail with an HTTP error once retries are exhausted on a retryable status.
    pub raise_on_status: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            status_forcelist: vec![408, 504],
            backoff_factor: 10.0,
            raise_on_status: true,
        }
    }
}

impl RetryPolicy {
    /// Also retry on `status` (e.g. 429).
    pub fn with_status(mut self, status: u16) -> Self {
        if !self.status_forcelist.contains(&status) {
            self.status_forcelist.push(status);
        }
        self
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.status_forcelist.contains(&status)
    }

    /// Sleep before retry number `retry_index` (0-based).
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let seconds = self.backoff_factor * 2f64.powi(retry_index as i32);
        clamp_seconds(seconds)
    }
}

fn clamp_seconds(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.min(BACKOFF_MAX_SECONDS).max(0.0))
}

/// HTTP session scoped to a base URI.
///
/// Retries only apply to URLs under the base URI.
pub struct HttpSession {
    base_url: Url,
    client: Client,
    policy: RetryPolicy,
    timeout: Duration,
}

impl HttpSession {
    pub fn new(base_url: &str, policy: RetryPolicy) -> GraphResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(GraphError::Config(format!(
                "{base_url} cannot be used as a base URI"
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            client,
            policy,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Base URI extended by path segments, each percent-encoded on its own.
    pub fn url(&self, segments: &[&str]) -> GraphResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GraphError::Config("base URI cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Start a request carrying the session timeout and a fresh client-request-id.
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .timeout(self.timeout)
            .header("client-request-id", Uuid::new_v4().to_string())
    }

    /// Send a request, retrying transient failures according to the policy.
    pub async fn send(&self, request: RequestBuilder) -> GraphResult<Response> {
        let request = request.build()?;
        let max_retries = if self.is_mounted(&request) {
            self.policy.retries
        } else {
            0
        };

        let mut retry_index = 0;
        loop {
            // Streaming bodies cannot be replayed
            let Some(attempt) = request.try_clone() else {
                return Ok(self.client.execute(request).await?);
            };

            debug!("{} {}", attempt.method(), attempt.url());
            match self.client.execute(attempt).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !self.policy.is_retryable(status) {
                        return Ok(response);
                    }

                    if retry_index >= max_retries {
                        if self.policy.raise_on_status && max_retries > 0 {
                            let body = match response.text().await {
                                Ok(body) => body,
                                Err(e) => {
                                    warn!(
                                        "Could not read body of HTTP {} from {}: {}",
                                        status,
                                        request.url(),
                                        e
                                    );
                                    String::new()
                                }
                            };
                            warn!(
                                "Giving up on {} after {} retries: HTTP {}",
                                request.url(),
                                max_retries,
                                status
                            );
                            return Err(GraphError::Http { status, body });
                        }
                        return Ok(response);
                    }

                    let delay = retry_after(&response)
                        .unwrap_or_else(|| self.policy.backoff(retry_index));
                    warn!(
                        "HTTP {} from {}, retry {}/{} in {:?}",
                        status,
                        request.url(),
                        retry_index + 1,
                        max_retries,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && retry_index < max_retries => {
                    let delay = self.policy.backoff(retry_index);
                    warn!(
                        "Request to {} failed ({}), retry {}/{} in {:?}",
                        request.url(),
                        e,
                        retry_index + 1,
                        max_retries,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(GraphError::Network(e)),
            }

            retry_index += 1;
        }
    }

    fn is_mounted(&self, request: &Request) -> bool {
        request.url().as_str().starts_with(self.base_url.as_str())
    }
}

/// Numeric `Retry-After` header, capped like the computed backoff.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|seconds| clamp_seconds(seconds as f64))
}
