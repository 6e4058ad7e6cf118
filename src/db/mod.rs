pub mod memory;
pub mod pool;
pub mod postgres;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryReportStore;
pub use pool::create_pool;
pub use postgres::PgReportStore;

use crate::entitlement::{AdjustmentPayload, EntitlementState};
use crate::pipeline::grounding::ReportDraft;
use crate::pipeline::sources::SourceFact;
use crate::pipeline::synthesize::{AnalysisDepth, SynthesisPath};
use crate::pipeline::valuation::ValuationResult;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub subject: String,
    pub analysis_depth: AnalysisDepth,
    pub valuation: ValuationResult,
    pub source_facts: Vec<SourceFact>,
    pub draft_report: ReportDraft,
    pub final_report: Option<ReportDraft>,
    pub synthesis_path: SynthesisPath,
    pub adjustment: Option<AdjustmentPayload>,
    pub entitlement: EntitlementState,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Keyed report storage. Every mutation is a guarded write that returns
/// `false` when its guard no longer holds.
#[async_trait::async_trait]
pub trait ReportStore: Send + Sync {
    async fn insert(&self, record: &ReportRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid, owner: &str) -> Result<Option<ReportRecord>, StoreError>;

    async fn list(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReportRecord>, StoreError>;

    /// Guarded by `adjustment_used = false`.
    async fn apply_adjustment(
        &self,
        id: Uuid,
        owner: &str,
        valuation: &ValuationResult,
        payload: &AdjustmentPayload,
    ) -> Result<bool, StoreError>;

    /// Guarded by `confirmed_at IS NULL`. Copies the draft into the final snapshot.
    async fn confirm(&self, id: Uuid, owner: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Guarded by the previous count, confirmation and the limit.
    async fn record_download(
        &self,
        id: Uuid,
        owner: &str,
        expected_used: u32,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::grounding::{Citation, FigureValue, KeyNumber, Section};
    use crate::pipeline::sources::TRADE_FACT_ID;
    use crate::pipeline::synthesize::FallbackReason;
    use crate::pipeline::valuation::{ValuationInput, ValuationWeights, compute_valuation};

    pub(crate) fn sample_record(owner: &str, download_limit: u32) -> ReportRecord {
        let fact = SourceFact {
            id: TRADE_FACT_ID.to_string(),
            title: "아파트 실거래가(국토교통부)".to_string(),
            url: "https://apis.data.go.kr/1613000/RTMSDataSvcAptTrade/getRTMSDataSvcAptTrade"
                .to_string(),
            summary: Some("거래금액: 840,000,000원".to_string()),
        };
        let draft = ReportDraft {
            summary: "역삼동 123 보고서".to_string(),
            sections: vec![Section {
                title: "물건 개요".to_string(),
                content: "전용면적: 84㎡".to_string(),
            }],
            key_numbers: vec![KeyNumber {
                label: "최근 실거래 단가".to_string(),
                value: Some(FigureValue::Number(10_000_000.0)),
                unit: "원/㎡".to_string(),
                citation_ids: vec![TRADE_FACT_ID.to_string()],
            }],
            cautions: vec![],
            citations: vec![Citation::from(&fact)],
            market_insight: None,
        };

        ReportRecord {
            id: Uuid::new_v4(),
            owner_id: owner.to_string(),
            subject: "역삼동 123".to_string(),
            analysis_depth: AnalysisDepth::Standard,
            valuation: compute_valuation(
                &ValuationInput {
                    area_m2: 84.0,
                    recent_trade_unit_price: Some(10_000_000),
                    public_based_unit_price: Some(6_000_000),
                },
                &ValuationWeights::default(),
            ),
            source_facts: vec![fact],
            draft_report: draft,
            final_report: None,
            synthesis_path: SynthesisPath::Fallback {
                reason: FallbackReason::NotConfigured,
            },
            adjustment: None,
            entitlement: EntitlementState::new(download_limit),
            trace_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let value = serde_json::to_value(sample_record("user-1", 3)).unwrap();
        assert_eq!(value["ownerId"], "user-1");
        assert_eq!(value["analysisDepth"], "standard");
        assert_eq!(value["entitlement"]["downloadLimit"], 3);
        assert_eq!(value["synthesisPath"]["reason"], "not_configured");
        assert!(value["finalReport"].is_null());
    }
}
