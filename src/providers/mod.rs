pub mod building;
pub mod land;
pub mod listing;
pub mod news;
pub mod trade;

use std::time::Duration;

use opentelemetry::KeyValue;
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::telemetry::metrics::UPSTREAM_REQUESTS;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned status {status}")]
    Status { provider: &'static str, status: u16 },

    #[error("{provider} payload unreadable: {message}")]
    Payload {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} url invalid: {message}")]
    InvalidUrl {
        provider: &'static str,
        message: String,
    },
}

impl UpstreamError {
    /// reqwest renders the request URL, query credentials included, so it is dropped.
    fn transport(provider: &'static str, source: reqwest::Error) -> Self {
        UpstreamError::Transport {
            provider,
            source: source.without_url(),
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            UpstreamError::Transport { source, .. } if source.is_timeout() => "timeout",
            UpstreamError::Transport { .. } => "transport_error",
            UpstreamError::Status { .. } => "status_error",
            UpstreamError::Payload { .. } => "payload_error",
            UpstreamError::InvalidUrl { .. } => "invalid_url",
        }
    }
}

/// Per-call time bound plus the number of extra attempts after the first.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// GET with a per-attempt timeout and a fixed backoff between attempts.
    /// Query strings may carry credentials, so only the path is recorded.
    #[tracing::instrument(
        name = "upstream.fetch",
        skip(self, url, headers, policy),
        fields(
            upstream.provider = provider,
            url.path = %url.path(),
            upstream.attempts,
            http.response.status_code,
        )
    )]
    pub async fn fetch_text(
        &self,
        provider: &'static str,
        url: reqwest::Url,
        headers: &[(&'static str, &str)],
        policy: FetchPolicy,
    ) -> Result<String, UpstreamError> {
        let span = tracing::Span::current();
        let mut attempt = 0;

        loop {
            attempt += 1;
            span.record("upstream.attempts", attempt);

            let result = self.fetch_once(provider, url.clone(), headers, policy).await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(err) => err.outcome(),
            };
            UPSTREAM_REQUESTS.add(
                1,
                &[
                    KeyValue::new("upstream.provider", provider),
                    KeyValue::new("upstream.outcome", outcome),
                ],
            );

            match result {
                Ok(body) => {
                    span.record("http.response.status_code", 200);
                    return Ok(body);
                }
                Err(err) if attempt <= policy.retries => {
                    tracing::warn!(
                        provider,
                        attempt,
                        error = %err,
                        "Upstream call failed, retrying"
                    );
                    tokio::time::sleep(policy.backoff).await;
                }
                Err(err) => {
                    if let UpstreamError::Status { status, .. } = &err {
                        span.record("http.response.status_code", *status);
                    }
                    return Err(err);
                }
            }
        }
    }

    pub async fn fetch_json(
        &self,
        provider: &'static str,
        url: reqwest::Url,
        headers: &[(&'static str, &str)],
        policy: FetchPolicy,
    ) -> Result<Value, UpstreamError> {
        let body = self.fetch_text(provider, url, headers, policy).await?;
        serde_json::from_str(&body).map_err(|e| UpstreamError::Payload {
            provider,
            message: e.to_string(),
        })
    }

    async fn fetch_once(
        &self,
        provider: &'static str,
        url: reqwest::Url,
        headers: &[(&'static str, &str)],
        policy: FetchPolicy,
    ) -> Result<String, UpstreamError> {
        let mut request = self.http.get(url).timeout(policy.timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .map_err(|source| UpstreamError::transport(provider, source))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                provider,
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|source| UpstreamError::transport(provider, source))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared HTTP client, credentials and time bounds for every upstream provider.
#[derive(Clone)]
pub struct Providers {
    pub client: UpstreamClient,
    pub gov_data_key: Option<String>,
    pub vworld_key: Option<String>,
    pub naver: Option<news::NaverCredentials>,
    pub upstream_timeout: Duration,
    pub trade_timeout: Duration,
    pub backoff: Duration,
}

impl Providers {
    pub fn from_config(config: &Config) -> Self {
        let naver = match (&config.naver_client_id, &config.naver_client_secret) {
            (Some(id), Some(secret)) => Some(news::NaverCredentials {
                client_id: id.clone(),
                client_secret: secret.clone(),
            }),
            _ => None,
        };

        Self {
            client: UpstreamClient::new(),
            gov_data_key: config.gov_data_key.clone(),
            vworld_key: config.vworld_key.clone(),
            naver,
            upstream_timeout: Duration::from_secs(config.upstream_timeout_secs),
            trade_timeout: Duration::from_secs(config.trade_timeout_secs),
            backoff: Duration::from_millis(config.upstream_retry_backoff_ms),
        }
    }

    /// Single attempt under the default time bound.
    pub fn single_attempt(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: self.upstream_timeout,
            retries: 0,
            backoff: self.backoff,
        }
    }

    /// One retry with the fixed backoff.
    pub fn with_retry(&self, timeout: Duration) -> FetchPolicy {
        FetchPolicy {
            timeout,
            retries: 1,
            backoff: self.backoff,
        }
    }
}

pub(crate) fn build_url(
    provider: &'static str,
    base: &str,
    params: &[(&str, &str)],
) -> Result<reqwest::Url, UpstreamError> {
    reqwest::Url::parse_with_params(base, params).map_err(|e| UpstreamError::InvalidUrl {
        provider,
        message: e.to_string(),
    })
}

/// Registry payloads return a single object where a list would hold one element.
pub(crate) fn item_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

/// Numbers arrive either as JSON numbers or as strings with thousands separators.
pub(crate) fn as_f64(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
            cleaned.parse().ok()?
        }
        _ => return None,
    };
    number.is_finite().then_some(number)
}

pub(crate) fn as_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Keeps the digits of a code and accepts it only at the exact length.
pub fn normalize_code(value: Option<&str>, len: usize) -> Option<String> {
    let digits: String = value?.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() == len).then_some(digits)
}

/// Address form safe for logs: first three and last two characters.
pub fn mask_address(value: &str) -> String {
    let chars: Vec<char> = value.trim().chars().collect();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}***{tail}")
}
