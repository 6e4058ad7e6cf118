use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
        CreateChatCompletionResponse,
    },
};

use super::{GenerateRequest, GenerateResponse, Provider};

const GEMINI_OPENAI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Chat-completions provider for OpenAI and the OpenAI-compatible
/// Gemini and Ollama endpoints.
pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    provider_name: &'static str,
}

impl OpenAIProvider {
    fn with_config(config: OpenAIConfig, provider_name: &'static str) -> Self {
        Self {
            client: Client::with_config(config),
            provider_name,
        }
    }

    pub fn new(api_key: &str) -> Self {
        Self::with_config(OpenAIConfig::new().with_api_key(api_key), "openai")
    }

    pub fn new_google(api_key: &str) -> Self {
        Self::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(GEMINI_OPENAI_BASE),
            "google",
        )
    }

    /// Ollama ignores the key but the client requires one.
    pub fn new_ollama(base_url: &str) -> Self {
        Self::with_config(
            OpenAIConfig::new()
                .with_api_key("ollama")
                .with_api_base(format!("{}/v1", base_url.trim_end_matches('/'))),
            "ollama",
        )
    }
}

fn chat_messages(req: &GenerateRequest) -> Vec<ChatCompletionRequestMessage> {
    let system = (!req.system.is_empty()).then(|| {
        ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionRequestSystemMessageContent::Text(req.system.clone()),
            name: None,
        })
    });
    let user = ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
        content: ChatCompletionRequestUserMessageContent::Text(req.prompt.clone()),
        name: None,
    });
    system.into_iter().chain(std::iter::once(user)).collect()
}

fn into_generate_response(response: CreateChatCompletionResponse) -> GenerateResponse {
    let choice = response.choices.first();
    let content = choice
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish_reason = choice
        .and_then(|c| c.finish_reason)
        .map(|r| format!("{r:?}").to_lowercase())
        .unwrap_or_default();
    let (input_tokens, output_tokens) = response
        .usage
        .as_ref()
        .map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));

    GenerateResponse {
        content,
        model: response.model,
        input_tokens,
        output_tokens,
        finish_reason,
        provider: String::new(),
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        #[allow(deprecated)]
        let request = CreateChatCompletionRequest {
            model: req.model.clone(),
            messages: chat_messages(req),
            temperature: Some(req.temperature),
            top_p: req.top_p,
            max_completion_tokens: Some(req.max_tokens),
            ..Default::default()
        };

        let response = self.client.chat().create(request).await?;
        Ok(into_generate_response(response))
    }

    fn name(&self) -> &str {
        self.provider_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(system: &str) -> GenerateRequest {
        GenerateRequest {
            model: "gemini-2.5-flash".to_string(),
            system: system.to_string(),
            prompt: "역삼동 123 보고서".to_string(),
            temperature: 0.2,
            top_p: Some(0.8),
            max_tokens: 2048,
            stage: "synthesize".to_string(),
        }
    }

    #[test]
    fn test_chat_messages() {
        let cases = vec![("You are an advisor.", 2), ("", 1)];
        for (system, expected) in cases {
            let messages = chat_messages(&request(system));
            assert_eq!(messages.len(), expected, "system {system:?}");
            assert!(matches!(
                messages.last(),
                Some(ChatCompletionRequestMessage::User(_))
            ));
        }
    }

    #[test]
    fn test_provider_names() {
        let cases = vec![
            (OpenAIProvider::new("key"), "openai"),
            (OpenAIProvider::new_google("key"), "google"),
            (OpenAIProvider::new_ollama("http://localhost:11434/"), "ollama"),
        ];
        for (provider, expected) in cases {
            assert_eq!(provider.name(), expected);
        }
    }
}
