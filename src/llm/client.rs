use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{GenerateRequest, GenerateResponse, Provider};
use crate::telemetry::metrics::{
    GEN_AI_ERROR_COUNT, GEN_AI_FALLBACK_COUNT, GEN_AI_OPERATION_DURATION, GEN_AI_RETRY_COUNT,
    GEN_AI_TOKEN_USAGE,
};

const PROMPT_EVENT_CHARS: usize = 1000;
const SYSTEM_EVENT_CHARS: usize = 500;
const COMPLETION_EVENT_CHARS: usize = 2000;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Completion client with bounded retries on the primary provider and an
/// optional secondary provider with its own model.
pub struct LlmClient {
    pub primary: Arc<dyn Provider>,
    pub fallback: Option<Arc<dyn Provider>>,
    pub primary_provider: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    pub max_attempts: u32,
}

fn server_endpoint(provider: &str) -> (&'static str, i64) {
    match provider {
        "openai" => ("api.openai.com", 443),
        "anthropic" => ("api.anthropic.com", 443),
        "google" => ("generativelanguage.googleapis.com", 443),
        "ollama" => ("localhost", 11434),
        _ => ("unknown", 443),
    }
}

fn chat_span(provider_name: &str, req: &GenerateRequest) -> Span {
    let (server_addr, server_port) = server_endpoint(provider_name);

    let span = tracing::info_span!(
        "gen_ai.chat",
        otel.name = %format!("gen_ai.chat {}", req.model),
        gen_ai.operation.name = "chat",
        gen_ai.provider.name = %provider_name,
        gen_ai.request.model = %req.model,
        server.address = %server_addr,
        server.port = server_port,
        gen_ai.request.temperature = req.temperature,
        gen_ai.request.max_tokens = req.max_tokens as i64,
        gen_ai.response.model = tracing::field::Empty,
        gen_ai.usage.input_tokens = tracing::field::Empty,
        gen_ai.usage.output_tokens = tracing::field::Empty,
        gen_ai.response.finish_reasons = tracing::field::Empty,
        report.stage = %req.stage,
        otel.status_code = tracing::field::Empty,
        error.type = tracing::field::Empty,
    );

    let mut attrs = vec![KeyValue::new(
        "gen_ai.prompt",
        truncate(&req.prompt, PROMPT_EVENT_CHARS),
    )];
    if !req.system.is_empty() {
        attrs.push(KeyValue::new(
            "gen_ai.system_instructions",
            truncate(&req.system, SYSTEM_EVENT_CHARS),
        ));
    }
    span.add_event("gen_ai.user.message", attrs);

    span
}

fn record_success(span: &Span, provider_name: &str, resp: &GenerateResponse, duration: f64) {
    span.record("gen_ai.response.model", resp.model.as_str());
    span.record("gen_ai.usage.input_tokens", resp.input_tokens as i64);
    span.record("gen_ai.usage.output_tokens", resp.output_tokens as i64);
    if !resp.finish_reason.is_empty() {
        span.record("gen_ai.response.finish_reasons", resp.finish_reason.as_str());
    }
    span.add_event(
        "gen_ai.assistant.message",
        vec![KeyValue::new(
            "gen_ai.completion",
            truncate(&resp.content, COMPLETION_EVENT_CHARS),
        )],
    );

    let attrs = [
        KeyValue::new("gen_ai.operation.name", "chat"),
        KeyValue::new("gen_ai.provider.name", provider_name.to_string()),
        KeyValue::new("gen_ai.request.model", resp.model.clone()),
    ];
    for (token_type, count) in [("input", resp.input_tokens), ("output", resp.output_tokens)] {
        let mut token_attrs = attrs.to_vec();
        token_attrs.push(KeyValue::new("gen_ai.token.type", token_type));
        GEN_AI_TOKEN_USAGE.record(f64::from(count), &token_attrs);
    }
    GEN_AI_OPERATION_DURATION.record(duration, &attrs);
}

fn provider_attrs(provider_name: &str, model: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("gen_ai.provider.name", provider_name.to_string()),
        KeyValue::new("gen_ai.request.model", model.to_string()),
    ]
}

/// Exponential backoff from one second, capped, plus up to 25% jitter.
fn retry_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1)
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_RETRY_DELAY);
    let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter_ms)
}

impl LlmClient {
    pub async fn generate_once(
        &self,
        provider: &dyn Provider,
        provider_name: &str,
        req: &GenerateRequest,
    ) -> anyhow::Result<GenerateResponse> {
        let start = Instant::now();
        let span = chat_span(provider_name, req);

        match provider.generate(req).instrument(span.clone()).await {
            Ok(mut resp) => {
                resp.provider = provider_name.to_string();
                record_success(&span, provider_name, &resp, start.elapsed().as_secs_f64());
                Ok(resp)
            }
            Err(err) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.type", classify_error(&err));
                GEN_AI_ERROR_COUNT.add(1, &provider_attrs(provider_name, &req.model));
                Err(err)
            }
        }
    }

    pub async fn generate_with_retry(
        &self,
        provider: &dyn Provider,
        provider_name: &str,
        req: &GenerateRequest,
    ) -> anyhow::Result<GenerateResponse> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match self.generate_once(provider, provider_name, req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };

            attempt += 1;
            tracing::warn!(
                attempt,
                max_attempts,
                provider = provider_name,
                model = %req.model,
                error = %err,
                "LLM call failed"
            );
            if attempt >= max_attempts {
                return Err(err);
            }

            GEN_AI_RETRY_COUNT.add(1, &provider_attrs(provider_name, &req.model));
            tokio::time::sleep(retry_delay(attempt - 1)).await;
        }
    }

    pub async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let primary_err = match self
            .generate_with_retry(self.primary.as_ref(), &self.primary_provider, req)
            .await
        {
            Ok(resp) => return Ok(resp),
            Err(err) => err,
        };

        let Some(fallback) = &self.fallback else {
            return Err(anyhow::anyhow!(
                "primary provider {} failed after retries: {}",
                self.primary_provider,
                primary_err
            ));
        };

        tracing::warn!(
            primary_provider = %self.primary_provider,
            fallback_provider = %self.fallback_provider,
            error = %primary_err,
            "Primary provider failed, falling back"
        );
        GEN_AI_FALLBACK_COUNT.add(
            1,
            &[KeyValue::new("gen_ai.provider.name", self.fallback_provider.clone())],
        );

        let fallback_req = GenerateRequest {
            model: self.fallback_model.clone(),
            ..req.clone()
        };
        self.generate_with_retry(fallback.as_ref(), &self.fallback_provider, &fallback_req)
            .await
    }
}

/// First matching category wins.
const ERROR_CATEGORIES: &[(&str, &[&str])] = &[
    ("rate_limit", &["rate limit", "429"]),
    ("timeout", &["timeout", "timed out", "deadline"]),
    ("auth_error", &["401", "403", "auth", "api key"]),
    ("invalid_request", &["400", "422", "invalid"]),
    ("server_error", &["500", "502", "503", "server"]),
    ("network_error", &["connect", "dns", "network", "reset"]),
];

pub(crate) fn classify_error(err: &anyhow::Error) -> &'static str {
    let msg = err.to_string().to_lowercase();
    ERROR_CATEGORIES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| msg.contains(n)))
        .map_or("unknown_error", |(label, _)| label)
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    s.char_indices()
        .take_while(|&(i, c)| i + c.len_utf8() <= max)
        .map(|(_, c)| c)
        .collect()
}
