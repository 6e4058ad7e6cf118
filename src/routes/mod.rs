pub mod compare;
pub mod health;
pub mod reports;
pub mod search;
pub mod valuation;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::client::hashed_key;
use crate::rate_limit::{RateDecision, RateRule};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/search/news", post(search::search_news))
        .route("/api/valuation", post(valuation::valuate))
        .route("/api/compare", post(compare::compare))
        .route("/api/reports", post(reports::create_report))
        .route("/api/reports", get(reports::list_reports))
        .route("/api/reports/{id}", get(reports::get_report))
        .route("/api/reports/{id}/adjust", post(reports::adjust_report))
        .route("/api/reports/{id}/confirm", post(reports::confirm_report))
        .route("/api/reports/{id}/download", post(reports::download_report))
        .with_state(state)
}

/// Charges one request against `key`, or rejects with the wait time.
pub(crate) fn admit(state: &AppState, key: &str, rule: &RateRule) -> AppResult<RateDecision> {
    let decision = state.rate_limiter.check(key, rule);
    if decision.allowed {
        return Ok(decision);
    }

    tracing::info!(
        client = %hashed_key(key),
        reason = decision.reason.map(|r| r.as_str()),
        wait_seconds = decision.wait_seconds,
        "Rate limited"
    );
    Err(AppError::RateLimited {
        wait_seconds: decision.wait_seconds,
        remaining_daily: decision.remaining_daily,
    })
}
