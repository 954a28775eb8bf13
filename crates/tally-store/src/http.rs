//! Shared HTTP client for remote platform APIs.
//!
//! All platform calls are bearer-token authenticated JSON; token exchanges
//! are form POSTs. Retries are limited to dispositions that are actually
//! retryable (5xx, 429, connect/timeout) with capped exponential backoff.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info_span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper shared by every adapter. Cloning is cheap; the
/// underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

enum RequestBody<'a> {
    None,
    Json(&'a JsonValue),
    Form(&'a [(&'a str, &'a str)]),
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Bearer-authenticated GET returning decoded JSON. `headers` carries
    /// platform extras such as API-version headers.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
        bearer: Option<&str>,
    ) -> Result<JsonValue, ApiError> {
        self.execute(reqwest::Method::GET, url, query, headers, bearer, RequestBody::None)
            .await
    }

    /// Bearer-authenticated POST with a JSON body.
    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        headers: &[(&str, &str)],
        bearer: Option<&str>,
    ) -> Result<JsonValue, ApiError> {
        self.execute(
            reqwest::Method::POST,
            url,
            &[],
            headers,
            bearer,
            RequestBody::Json(body),
        )
        .await
    }

    /// Unauthenticated form POST; token-refresh endpoints use this shape.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<JsonValue, ApiError> {
        self.execute(reqwest::Method::POST, url, &[], &[], None, RequestBody::Form(form))
            .await
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
        bearer: Option<&str>,
        body: RequestBody<'_>,
    ) -> Result<JsonValue, ApiError> {
        let span = info_span!("api_request", %method, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.request(method.clone(), url);
            if !query.is_empty() {
                request = request.query(query);
            }
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            request = match &body {
                RequestBody::None => request,
                RequestBody::Json(value) => request.json(value),
                RequestBody::Form(pairs) => request.form(pairs),
            };

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.json::<JsonValue>().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(ApiError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ApiError::Request(err));
                }
            }
        }

        Err(ApiError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
