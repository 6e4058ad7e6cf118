use axum::{Json, extract::State};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::ClientIdentity;
use crate::pipeline::sources::{SourceFact, build_news_facts};
use crate::providers::news::{self, NewsItem, SearchSort, clamp_display, sanitize_query};

const NEWS_FACT_LIMIT: usize = 5;

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
    pub display: Option<i64>,
    #[serde(default)]
    pub sort: SearchSort,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub items: Vec<NewsItem>,
    pub source_facts: Vec<SourceFact>,
    pub remaining_daily: u32,
}

pub async fn search_news(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Json(body): Json<SearchBody>,
) -> AppResult<Json<SearchResponse>> {
    let query = sanitize_query(&body.query).map_err(|e| AppError::InvalidInput(e.to_string()))?;
    let credentials = state
        .providers
        .naver
        .as_ref()
        .ok_or_else(|| AppError::ConfigMissing("NAVER_CLIENT_ID".into()))?;

    let decision = super::admit(&state, &identity.key, identity.rule(&state.config))?;

    let items = news::search_news(
        &state.providers,
        credentials,
        &query,
        clamp_display(body.display),
        body.sort,
    )
    .await
    .map_err(|e| AppError::UpstreamFailed(e.to_string()))?;

    let source_facts = build_news_facts(&items, &query, Utc::now(), NEWS_FACT_LIMIT);

    Ok(Json(SearchResponse {
        items,
        source_facts,
        remaining_daily: decision.remaining_daily,
    }))
}
