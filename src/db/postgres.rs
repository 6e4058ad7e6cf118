use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::{ReportRecord, ReportStore, StoreError};
use crate::entitlement::{AdjustmentPayload, EntitlementState};
use crate::pipeline::grounding::ReportDraft;
use crate::pipeline::sources::SourceFact;
use crate::pipeline::synthesize::{AnalysisDepth, SynthesisPath};
use crate::pipeline::valuation::ValuationResult;

const SCHEMA: &str = include_str!("../../migrations/001_reports.sql");

const SELECT_COLUMNS: &str = "SELECT id, owner_id, subject, analysis_depth, valuation, source_facts, \
     draft_report, final_report, synthesis_path, adjustment, adjustment_used, download_limit, \
     downloads_used, confirmed_at, trace_id, created_at FROM reports";

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    owner_id: String,
    subject: String,
    analysis_depth: String,
    valuation: Json<ValuationResult>,
    source_facts: Json<Vec<SourceFact>>,
    draft_report: Json<ReportDraft>,
    final_report: Option<Json<ReportDraft>>,
    synthesis_path: Json<SynthesisPath>,
    adjustment: Option<Json<AdjustmentPayload>>,
    adjustment_used: bool,
    download_limit: i32,
    downloads_used: i32,
    confirmed_at: Option<DateTime<Utc>>,
    trace_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for ReportRecord {
    type Error = StoreError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let analysis_depth: AnalysisDepth =
            serde_json::from_value(serde_json::Value::String(row.analysis_depth))?;

        Ok(ReportRecord {
            id: row.id,
            owner_id: row.owner_id,
            subject: row.subject,
            analysis_depth,
            valuation: row.valuation.0,
            source_facts: row.source_facts.0,
            draft_report: row.draft_report.0,
            final_report: row.final_report.map(|r| r.0),
            synthesis_path: row.synthesis_path.0,
            adjustment: row.adjustment.map(|a| a.0),
            entitlement: EntitlementState {
                adjustment_used: row.adjustment_used,
                download_limit: row.download_limit.max(0) as u32,
                downloads_used: row.downloads_used.max(0) as u32,
                confirmed_at: row.confirmed_at,
            },
            trace_id: row.trace_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the idempotent schema script.
    #[tracing::instrument(name = "db.reports.ensure_schema", skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Report schema ready");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReportStore for PgReportStore {
    #[tracing::instrument(name = "db.reports.insert", skip_all, fields(report.id = %record.id))]
    async fn insert(&self, record: &ReportRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reports \
             (id, owner_id, subject, analysis_depth, valuation, source_facts, draft_report, \
              final_report, synthesis_path, adjustment, adjustment_used, download_limit, \
              downloads_used, confirmed_at, trace_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(record.id)
        .bind(&record.owner_id)
        .bind(&record.subject)
        .bind(record.analysis_depth.as_str())
        .bind(Json(&record.valuation))
        .bind(Json(&record.source_facts))
        .bind(Json(&record.draft_report))
        .bind(record.final_report.as_ref().map(Json))
        .bind(Json(&record.synthesis_path))
        .bind(record.adjustment.as_ref().map(Json))
        .bind(record.entitlement.adjustment_used)
        .bind(record.entitlement.download_limit as i32)
        .bind(record.entitlement.downloads_used as i32)
        .bind(record.entitlement.confirmed_at)
        .bind(record.trace_id.as_deref())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(name = "db.reports.get", skip(self, owner))]
    async fn get(&self, id: Uuid, owner: &str) -> Result<Option<ReportRecord>, StoreError> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            "{SELECT_COLUMNS} WHERE id = $1 AND owner_id = $2"
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReportRecord::try_from).transpose()
    }

    #[tracing::instrument(name = "db.reports.list", skip(self, owner))]
    async fn list(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReportRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ReportRow>(&format!(
            "{SELECT_COLUMNS} WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(owner)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReportRecord::try_from).collect()
    }

    #[tracing::instrument(name = "db.reports.apply_adjustment", skip_all, fields(report.id = %id))]
    async fn apply_adjustment(
        &self,
        id: Uuid,
        owner: &str,
        valuation: &ValuationResult,
        payload: &AdjustmentPayload,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE reports SET valuation = $3, adjustment = $4, adjustment_used = TRUE \
             WHERE id = $1 AND owner_id = $2 AND adjustment_used = FALSE",
        )
        .bind(id)
        .bind(owner)
        .bind(Json(valuation))
        .bind(Json(payload))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(name = "db.reports.confirm", skip(self, owner))]
    async fn confirm(&self, id: Uuid, owner: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE reports SET final_report = draft_report, confirmed_at = $3 \
             WHERE id = $1 AND owner_id = $2 AND confirmed_at IS NULL",
        )
        .bind(id)
        .bind(owner)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(name = "db.reports.record_download", skip(self, owner))]
    async fn record_download(
        &self,
        id: Uuid,
        owner: &str,
        expected_used: u32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE reports SET downloads_used = downloads_used + 1 \
             WHERE id = $1 AND owner_id = $2 AND downloads_used = $3 \
               AND confirmed_at IS NOT NULL AND downloads_used < download_limit",
        )
        .bind(id)
        .bind(owner)
        .bind(expected_used as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
