pub mod anthropic;
pub mod client;
pub mod openai;

use std::sync::Arc;

pub use client::LlmClient;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub max_tokens: u32,
    pub stage: String,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: String,
    pub provider: String,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse>;
    fn name(&self) -> &str;
}

/// Builds the named provider, or `None` when it is unknown or its credential is absent.
pub fn build_provider(name: &str, config: &Config) -> Option<Arc<dyn Provider>> {
    match name {
        "ollama" => Some(Arc::new(openai::OpenAIProvider::new_ollama(
            &config.ollama_base_url,
        ))),
        "openai" => config
            .llm_api_key(name)
            .map(|key| Arc::new(openai::OpenAIProvider::new(key)) as Arc<dyn Provider>),
        "google" => config
            .llm_api_key(name)
            .map(|key| Arc::new(openai::OpenAIProvider::new_google(key)) as Arc<dyn Provider>),
        "anthropic" => config.llm_api_key(name).map(|key| {
            Arc::new(anthropic::AnthropicProvider::new(key)) as Arc<dyn Provider>
        }),
        _ => None,
    }
}

/// Primary plus optional secondary provider, or `None` when the primary is unusable.
pub fn build_client(config: &Config) -> Option<LlmClient> {
    let primary = build_provider(&config.llm_provider, config)?;
    let fallback = build_provider(&config.fallback_provider, config);

    Some(LlmClient {
        primary,
        fallback,
        primary_provider: config.llm_provider.clone(),
        fallback_provider: config.fallback_provider.clone(),
        fallback_model: config.fallback_model.clone(),
        max_attempts: config.llm_max_attempts.max(1),
    })
}
