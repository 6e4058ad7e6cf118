use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use super::fallback::build_fallback_report;
use super::grounding::{ReportDraft, Validation, validate_report};
use super::insight::{DefaultKeywordRules, KeywordRules};
use super::sources::SourceFact;
use super::valuation::ValuationResult;
use crate::config::Config;
use crate::llm::{self, GenerateRequest, LlmClient};
use crate::telemetry::metrics::REPORT_SYNTHESIS_PATH;

const SYSTEM_PROMPT: &str = "당신은 50대 고액자산가를 상대하는 부동산 자산관리사(CFA)입니다. \
전문적이면서도 이해하기 쉬운 어조로 분석 결과를 작성하세요. \
핵심 결론은 ==텍스트== 형식으로 강조하여 빠르게 파악할 수 있게 하세요.";

const OUTPUT_SCHEMA: &str = r##"{
  "summary": "string - length depends on AnalysisDepth. Use line breaks and bullets for skimmability.",
  "sections": [{"title": "string", "content": "string - use ==text== for key highlights"}],
  "keyNumbers": [{"label": "string", "value": number|null, "unit": "string", "citationIds": ["source_id"]}],
  "cautions": ["string - warnings about data limitations"],
  "citations": [{"id": "source_id", "title": "string", "url": "string"}],
  "marketInsight": {
    "keywords": ["#해시태그형식_키워드 (max 4)"],
    "keywordContext": "string - 1~2 sentences on why the keywords matter, from provided data only",
    "news": [{"title": "string", "url": "string", "publishedAt": "string|null"}],
    "expertOpinion": {
      "priceBackground": "price trend background (include ==key==)",
      "riskFactors": "risks such as the assessed-price gap (include ==key==)",
      "outlook": "outlook and strategy (include ==key==)"
    },
    "swot": {"strength": "one sentence", "weakness": "one sentence", "opportunity": "one sentence", "threat": "one sentence"}
  }
}"##;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDepth {
    Basic,
    #[default]
    Standard,
    Premium,
}

impl AnalysisDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisDepth::Basic => "basic",
            AnalysisDepth::Standard => "standard",
            AnalysisDepth::Premium => "premium",
        }
    }

    pub fn bullet_limit(&self) -> usize {
        match self {
            AnalysisDepth::Basic => 3,
            AnalysisDepth::Standard => 5,
            AnalysisDepth::Premium => 6,
        }
    }

    fn length_rules(&self) -> &'static str {
        match self {
            AnalysisDepth::Basic => {
                "- summary: 4~6 sentences, then a '핵심 포인트' list of 3 bullets\n\
                 - each marketInsight.expertOpinion paragraph: 2~3 sentences"
            }
            AnalysisDepth::Standard => {
                "- summary: 6~10 sentences, then a '핵심 포인트' list of 4~5 bullets\n\
                 - each marketInsight.expertOpinion paragraph: 3~5 sentences"
            }
            AnalysisDepth::Premium => {
                "- summary: 8~12 sentences, then a '핵심 포인트' list of 5~6 bullets\n\
                 - add '투자 전략' and '리스크 체크리스트' sections\n\
                 - each marketInsight.expertOpinion paragraph: 4~6 sentences"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NotConfigured,
    Timeout,
    ProviderError,
    /// Holds the validation failure code.
    Rejected(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NotConfigured => f.write_str("not_configured"),
            FallbackReason::Timeout => f.write_str("timeout"),
            FallbackReason::ProviderError => f.write_str("provider_error"),
            FallbackReason::Rejected(code) => write!(f, "rejected({code})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum SynthesisPath {
    Llm { provider: String, model: String },
    Fallback { reason: FallbackReason },
}

impl SynthesisPath {
    pub fn is_fallback(&self) -> bool {
        matches!(self, SynthesisPath::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<String> {
        match self {
            SynthesisPath::Fallback { reason } => Some(reason.to_string()),
            SynthesisPath::Llm { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub report: ReportDraft,
    pub path: SynthesisPath,
}

pub fn build_prompt(
    subject: &str,
    depth: AnalysisDepth,
    valuation: &ValuationResult,
    facts: &[SourceFact],
) -> String {
    let valuation_json = serde_json::to_string(valuation).unwrap_or_else(|_| "{}".to_string());
    let source_list = facts
        .iter()
        .map(|f| {
            format!(
                "- id:{}, title:{}, url:{}, summary:{}",
                f.id,
                f.title,
                f.url,
                f.summary.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Return ONLY valid JSON. No explanation and no markdown outside the JSON object.\n\n\
        ## CRITICAL RULES (MUST FOLLOW)\n\
        - DO NOT INVENT or FABRICATE any information.\n\
        - DO NOT use general market knowledge outside of the provided data.\n\
        - If data is missing, explicitly write \"확인 불가\" or \"데이터 부족\".\n\
        - Every number MUST have at least one citationId taken from SourceFacts.\n\
        - Use ==important text== to highlight 2-3 key conclusions per section.\n\
        - If uncertain, add \"추가 조사 필요\" to the cautions array.\n\
        - If any SourceFact id starts with \"naver_news_\", mention 1~2 of those titles in the summary \
        or outlook and fill marketInsight.news from those SourceFacts only (max 5).\n\n\
        Language: ko\n\
        AnalysisDepth: {depth}\n\
        Subject: {subject}\n\n\
        ## CONTENT LENGTH RULES (BY AnalysisDepth)\n\
        {length_rules}\n\n\
        ## PROVIDED DATA (USE ONLY THIS)\n\
        ValuationData: {valuation_json}\n\n\
        SourceFacts:\n\
        {source_list}\n\n\
        ## OUTPUT JSON SCHEMA\n\
        {OUTPUT_SCHEMA}",
        depth = depth.as_str(),
        length_rules = depth.length_rules(),
    )
}

/// Completion attempt raced against a deadline, gated by the grounding
/// validator, with the template report as the answer for every failure.
pub struct Synthesizer {
    llm: Option<Arc<LlmClient>>,
    model: String,
    timeout: Duration,
    temperature: f32,
    max_tokens: u32,
    rules: Arc<dyn KeywordRules>,
}

impl Synthesizer {
    pub fn new(llm: Option<Arc<LlmClient>>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            model: model.into(),
            timeout,
            temperature: 0.2,
            max_tokens: 2048,
            rules: Arc::new(DefaultKeywordRules),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let llm = llm::build_client(config).map(Arc::new);
        if llm.is_none() {
            tracing::warn!(
                provider = %config.llm_provider,
                "Completion provider not configured, reports will use the template path"
            );
        }

        Self {
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
            ..Self::new(
                llm,
                config.llm_model.clone(),
                Duration::from_secs(config.llm_timeout_secs),
            )
        }
    }

    pub fn with_rules(mut self, rules: Arc<dyn KeywordRules>) -> Self {
        self.rules = rules;
        self
    }

    #[tracing::instrument(
        name = "pipeline_stage synthesize",
        skip(self, subject, valuation, facts),
        fields(
            pipeline.stage = "synthesize",
            analysis.depth = depth.as_str(),
            synthesis.path,
            synthesis.fallback_reason,
        )
    )]
    pub async fn synthesize(
        &self,
        subject: &str,
        depth: AnalysisDepth,
        valuation: &ValuationResult,
        facts: &[SourceFact],
    ) -> SynthesisOutcome {
        let path = match self.attempt(subject, depth, valuation, facts).await {
            Ok((report, path)) => return self.finish(report, path),
            Err(reason) => SynthesisPath::Fallback { reason },
        };

        let report = build_fallback_report(subject, depth, valuation, facts, self.rules.as_ref());
        self.finish(report, path)
    }

    async fn attempt(
        &self,
        subject: &str,
        depth: AnalysisDepth,
        valuation: &ValuationResult,
        facts: &[SourceFact],
    ) -> Result<(ReportDraft, SynthesisPath), FallbackReason> {
        let Some(llm) = &self.llm else {
            return Err(FallbackReason::NotConfigured);
        };

        let req = GenerateRequest {
            model: self.model.clone(),
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(subject, depth, valuation, facts),
            temperature: self.temperature,
            top_p: Some(0.8),
            max_tokens: self.max_tokens,
            stage: "synthesize".to_string(),
        };

        let resp = match tokio::time::timeout(self.timeout, llm.generate(&req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Completion failed, using template report");
                return Err(FallbackReason::ProviderError);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Completion timed out, using template report"
                );
                return Err(FallbackReason::Timeout);
            }
        };

        match validate_report(&resp.content, facts) {
            Validation::Valid(report) => Ok((
                report,
                SynthesisPath::Llm {
                    provider: resp.provider,
                    model: resp.model,
                },
            )),
            Validation::Invalid(failure) => {
                tracing::warn!(
                    reason = failure.code(),
                    error = %failure,
                    "Completion rejected by grounding check"
                );
                Err(FallbackReason::Rejected(failure.code().to_string()))
            }
        }
    }

    fn finish(&self, report: ReportDraft, path: SynthesisPath) -> SynthesisOutcome {
        let (label, reason) = match &path {
            SynthesisPath::Llm { .. } => ("llm", String::new()),
            SynthesisPath::Fallback { reason } => ("fallback", reason.to_string()),
        };

        let span = tracing::Span::current();
        span.record("synthesis.path", label);
        if !reason.is_empty() {
            span.record("synthesis.fallback_reason", reason.as_str());
        }

        REPORT_SYNTHESIS_PATH.add(
            1,
            &[
                KeyValue::new("synthesis.path", label),
                KeyValue::new("synthesis.reason", reason),
            ],
        );

        SynthesisOutcome { report, path }
    }
}
