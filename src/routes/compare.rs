use axum::{Json, extract::State};
use chrono::Utc;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::ClientIdentity;
use crate::pipeline::comparables::{CompareRequest, ComparisonResult, compare_properties};

pub async fn compare(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Json(request): Json<CompareRequest>,
) -> AppResult<Json<ComparisonResult>> {
    request.target()?;
    if state.providers.gov_data_key.is_none() {
        return Err(AppError::ConfigMissing("GOV_DATA_KEY".into()));
    }

    super::admit(&state, &identity.key, identity.rule(&state.config))?;

    let result = compare_properties(&state.providers, &request, Utc::now().date_naive()).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    use super::super::create_router;
    use super::super::tests::{json_request, read_json, test_state};
    use crate::config::Config;

    #[tokio::test]
    async fn test_compare_rejections() {
        let mut keyed = Config::for_tests();
        keyed.gov_data_key = Some("gov".to_string());

        let cases = vec![
            (keyed.clone(), json!({ "targetAreaM2": 84.0 }), StatusCode::BAD_REQUEST, "invalid_input"),
            (keyed.clone(), json!({ "lawdCd": "11680" }), StatusCode::BAD_REQUEST, "invalid_input"),
            (keyed, json!({ "lawdCd": "11680", "targetAreaM2": -3.0 }), StatusCode::BAD_REQUEST, "invalid_input"),
            (
                Config::for_tests(),
                json!({ "lawdCd": "11680", "targetAreaM2": 84.0 }),
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_missing",
            ),
        ];

        for (config, body, expected_status, expected_code) in cases {
            let state = test_state(config);
            let request = json_request("POST", "/api/compare", None, body.clone());

            let response = create_router(state.clone()).oneshot(request).await.unwrap();

            assert_eq!(response.status(), expected_status, "body {body}");
            assert_eq!(read_json(response).await["code"], expected_code, "body {body}");
        }
    }

    #[tokio::test]
    async fn test_compare_rejections_do_not_charge_quota() {
        let state = test_state(Config::for_tests());
        let body = json!({ "lawdCd": "11680", "targetAreaM2": 84.0 });

        for _ in 0..3 {
            let request = json_request("POST", "/api/compare", None, body.clone());
            let response = create_router(state.clone()).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }

        let decision = state.rate_limiter.check("guest:0.0.0.0", &state.config.guest_rate);
        assert!(decision.allowed);
        assert_eq!(decision.remaining_daily, state.config.guest_rate.daily_limit - 1);
    }
}
