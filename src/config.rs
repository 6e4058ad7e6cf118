use std::env;
use std::str::FromStr;

use crate::pipeline::valuation::ValuationWeights;
use crate::rate_limit::RateRule;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub database_url: Option<String>,
    pub llm_provider: String,
    pub llm_model: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    pub ollama_base_url: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub llm_timeout_secs: u64,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_max_attempts: u32,
    pub gov_data_key: Option<String>,
    pub vworld_key: Option<String>,
    pub naver_client_id: Option<String>,
    pub naver_client_secret: Option<String>,
    pub upstream_timeout_secs: u64,
    pub trade_timeout_secs: u64,
    pub upstream_retry_backoff_ms: u64,
    pub jwt_secret: Option<String>,
    pub member_rate: RateRule,
    pub guest_rate: RateRule,
    pub valuation_weights: ValuationWeights,
    pub report_download_limit: u32,
    pub otel_service_name: String,
    pub otel_exporter_endpoint: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            port: parsed("APP_PORT", "8080"),
            environment: env::var("APP_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            database_url: optional("DATABASE_URL"),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "google".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            fallback_provider: env::var("FALLBACK_PROVIDER")
                .unwrap_or_else(|_| "none".to_string()),
            fallback_model: env::var("FALLBACK_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5-20251001".to_string()),
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            openai_api_key: optional("OPENAI_API_KEY"),
            anthropic_api_key: optional("ANTHROPIC_API_KEY"),
            google_api_key: optional("GOOGLE_API_KEY"),
            llm_timeout_secs: parsed("LLM_TIMEOUT_SECS", "50"),
            llm_temperature: parsed("LLM_TEMPERATURE", "0.2"),
            llm_max_tokens: parsed("LLM_MAX_TOKENS", "2048"),
            llm_max_attempts: parsed("LLM_MAX_ATTEMPTS", "2"),
            gov_data_key: optional("GOV_DATA_KEY"),
            vworld_key: optional("VWORLD_KEY"),
            naver_client_id: optional("NAVER_CLIENT_ID"),
            naver_client_secret: optional("NAVER_CLIENT_SECRET"),
            upstream_timeout_secs: parsed("UPSTREAM_TIMEOUT_SECS", "10"),
            trade_timeout_secs: parsed("TRADE_TIMEOUT_SECS", "30"),
            upstream_retry_backoff_ms: parsed("UPSTREAM_RETRY_BACKOFF_MS", "1000"),
            jwt_secret: optional("JWT_SECRET"),
            member_rate: RateRule {
                daily_limit: parsed("RATE_MEMBER_DAILY_LIMIT", "50"),
                cooldown_secs: parsed("RATE_MEMBER_COOLDOWN_SECS", "5"),
            },
            guest_rate: RateRule {
                daily_limit: parsed("RATE_GUEST_DAILY_LIMIT", "15"),
                cooldown_secs: parsed("RATE_GUEST_COOLDOWN_SECS", "10"),
            },
            valuation_weights: ValuationWeights {
                trade_weight: parsed("VALUATION_TRADE_WEIGHT", "0.6"),
                public_weight: parsed("VALUATION_PUBLIC_WEIGHT", "0.4"),
                trade_only_factor: parsed("VALUATION_TRADE_ONLY_FACTOR", "0.9"),
                public_only_factor: parsed("VALUATION_PUBLIC_ONLY_FACTOR", "1.5"),
            },
            report_download_limit: parsed("REPORT_DOWNLOAD_LIMIT", "3"),
            otel_service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "parcel-report".to_string()),
            otel_exporter_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Credential for a completion provider name, if that provider needs one.
    pub fn llm_api_key(&self, provider: &str) -> Option<&str> {
        match provider {
            "openai" => self.openai_api_key.as_deref(),
            "anthropic" => self.anthropic_api_key.as_deref(),
            "google" => self.google_api_key.as_deref(),
            _ => None,
        }
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: &str) -> T {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or_else(|_| panic!("{name} must be a number"))
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            environment: "test".to_string(),
            database_url: None,
            llm_provider: "google".to_string(),
            llm_model: "gemini-2.5-flash".to_string(),
            fallback_provider: "none".to_string(),
            fallback_model: String::new(),
            ollama_base_url: "http://localhost:11434".to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            google_api_key: None,
            llm_timeout_secs: 50,
            llm_temperature: 0.2,
            llm_max_tokens: 2048,
            llm_max_attempts: 1,
            gov_data_key: None,
            vworld_key: None,
            naver_client_id: None,
            naver_client_secret: None,
            upstream_timeout_secs: 10,
            trade_timeout_secs: 30,
            upstream_retry_backoff_ms: 1000,
            jwt_secret: Some("test-secret-key-for-jwt".to_string()),
            member_rate: RateRule {
                daily_limit: 50,
                cooldown_secs: 5,
            },
            guest_rate: RateRule {
                daily_limit: 15,
                cooldown_secs: 10,
            },
            valuation_weights: ValuationWeights::default(),
            report_download_limit: 3,
            otel_service_name: "parcel-report-test".to_string(),
            otel_exporter_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_production() {
        let mut config = Config::for_tests();
        assert!(!config.is_production());
        config.environment = "production".to_string();
        assert!(config.is_production());
    }

    #[test]
    fn test_llm_api_key_lookup() {
        let mut config = Config::for_tests();
        config.google_api_key = Some("g-key".to_string());
        config.anthropic_api_key = Some("a-key".to_string());

        let cases = vec![
            ("google", Some("g-key")),
            ("anthropic", Some("a-key")),
            ("openai", None),
            ("ollama", None),
            ("unknown", None),
        ];

        for (provider, expected) in cases {
            assert_eq!(config.llm_api_key(provider), expected, "provider {provider}");
        }
    }
}
