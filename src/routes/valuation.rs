use axum::{Json, extract::State};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppResult;
use crate::pipeline::valuation::{
    RawValuationInput, ValuationInput, ValuationResult, compute_valuation, select_area,
};

/// Amounts plus the area candidates `select_area` chooses from.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationBody {
    pub trade_area_m2: Option<f64>,
    pub representative_area_m2: Option<f64>,
    pub area_m2: Option<f64>,
    pub recent_trade_price_won: Option<f64>,
    pub public_price_per_m2: Option<f64>,
}

impl ValuationBody {
    pub fn raw_input(&self) -> RawValuationInput {
        RawValuationInput {
            area_m2: select_area(self.trade_area_m2, self.representative_area_m2, self.area_m2),
            recent_trade_price_won: self.recent_trade_price_won,
            public_price_per_m2: self.public_price_per_m2,
        }
    }
}

pub async fn valuate(
    State(state): State<AppState>,
    Json(body): Json<ValuationBody>,
) -> AppResult<Json<ValuationResult>> {
    let input = ValuationInput::from_raw(&body.raw_input());
    Ok(Json(compute_valuation(&input, &state.config.valuation_weights)))
}
