use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::db::ReportRecord;
use crate::entitlement::Download;
use crate::error::{AppError, AppResult};
use crate::middleware::AuthUser;
use crate::pipeline::orchestrator::registry_keys;
use crate::pipeline::{ReportRequest, generate_report};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustBody {
    pub current_percent: f64,
    pub fair_unit_price: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedReport {
    #[serde(flatten)]
    pub report: ReportRecord,
    pub llm_fallback: bool,
    pub fallback_reason: Option<String>,
}

impl From<ReportRecord> for CreatedReport {
    fn from(report: ReportRecord) -> Self {
        Self {
            llm_fallback: report.synthesis_path.is_fallback(),
            fallback_reason: report.synthesis_path.fallback_reason(),
            report,
        }
    }
}

pub async fn create_report(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Json(request): Json<ReportRequest>,
) -> AppResult<(StatusCode, Json<CreatedReport>)> {
    request.subject()?;
    registry_keys(&state.providers)?;
    super::admit(&state, &format!("member:{owner}"), &state.config.member_rate)?;

    let report = generate_report(&state, &owner, &request).await?;

    tracing::info!(
        report.id = %report.id,
        llm_fallback = report.synthesis_path.is_fallback(),
        "Report generated"
    );

    Ok((StatusCode::CREATED, Json(CreatedReport::from(report))))
}

pub async fn list_reports(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Query(params): Query<ListQuery>,
) -> AppResult<Json<Vec<ReportRecord>>> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0).max(0);

    let reports = state.reports.list(&owner, limit, offset).await?;

    Ok(Json(reports))
}

pub async fn get_report(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReportRecord>> {
    let report = state
        .reports
        .get(id, &owner)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Report {} not found", id)))?;

    Ok(Json(report))
}

pub async fn adjust_report(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<AdjustBody>,
) -> AppResult<Json<ReportRecord>> {
    let report = state
        .entitlements
        .adjust(id, &owner, body.current_percent, body.fair_unit_price)
        .await?;

    Ok(Json(report))
}

pub async fn confirm_report(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReportRecord>> {
    let report = state.entitlements.confirm(id, &owner).await?;

    Ok(Json(report))
}

pub async fn download_report(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Download>> {
    let download = state.entitlements.download(id, &owner).await?;

    Ok(Json(download))
}
