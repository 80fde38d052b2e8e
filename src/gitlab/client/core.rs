use std::time::Duration;

use graphql_client::{QueryBody, Response as GraphQLResponse};
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response};
use url::Url;

use crate::auth::Token;
use crate::error::{Result, SyncError};

/// Backoff applied to rate limits, server errors and transient network errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct GitLabClient {
    pub(super) client: Client,
    pub(super) graphql_url: Url,
    pub(super) api_url: Url,
    token: Option<Token>,
    retry: RetryPolicy,
}

impl GitLabClient {
    pub fn new(
        base_url: &str,
        token: Option<Token>,
        retry: RetryPolicy,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder().user_agent(concat!("cisync/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;

        // Without a trailing slash `join` would replace the last path segment
        // of installations served below a prefix.
        let mut base = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("Invalid base URL: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let graphql_url = base
            .join("api/graphql")
            .map_err(|e| SyncError::Config(format!("Invalid GraphQL URL: {e}")))?;
        let api_url = base
            .join("api/v4/")
            .map_err(|e| SyncError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            graphql_url,
            api_url,
            token,
            retry,
        })
    }

    pub fn auth_request(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    /// Resolves `path` against the REST base URL.
    pub(super) fn api_endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("Invalid API URL '{path}': {e}")))
    }

    /// Sends the request built by `build`, retrying network errors, rate
    /// limits and server errors with exponential backoff.
    ///
    /// # Errors
    /// Returns an error if:
    /// * retries are exhausted
    /// * the server answers with a non-retryable error status
    pub(super) async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let max_retries = self.retry.max_retries;
        let mut retry_count = 0;

        loop {
            let request = self.auth_request(build());

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                    if retry_count >= max_retries {
                        return Err(e.into());
                    }
                    let delay = self.retry.delay(retry_count);
                    warn!(
                        "Network error ({e}), retrying in {delay:?} ({}/{max_retries})...",
                        retry_count + 1
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                if retry_count >= max_retries {
                    return Err(SyncError::ApiErrorAfterRetries {
                        status: status.as_u16(),
                        retries: max_retries,
                    });
                }

                let delay = self.retry.delay(retry_count);
                warn!(
                    "GitLab API error (status {status}). Waiting {delay:?} before retry {}/{max_retries}...",
                    retry_count + 1
                );

                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                return Err(SyncError::ApiError {
                    status: status.as_u16(),
                    message: error_text,
                });
            }

            return Ok(response);
        }
    }

    /// Executes a GraphQL document and returns its `data` after checking for
    /// errors.
    pub(super) async fn execute_graphql_request<T>(
        &self,
        operation_name: &'static str,
        query: &'static str,
        variables: serde_json::Value,
    ) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let body = QueryBody {
            variables,
            query,
            operation_name,
        };

        debug!("GraphQL {operation_name}");
        let response = self
            .send(|| self.client.post(self.graphql_url.clone()).json(&body))
            .await?;

        let response_body: GraphQLResponse<T> = response.json().await?;

        if let Some(errors) = response_body.errors {
            if !errors.is_empty() {
                return Err(SyncError::GraphQLError {
                    query: operation_name.to_string(),
                    errors: errors
                        .iter()
                        .map(|e| e.message.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }

        response_body.data.ok_or(SyncError::NoResponseData)
    }
}

#[cfg(test)]
pub(super) fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}
