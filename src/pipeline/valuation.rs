use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use crate::telemetry::metrics::VALUATION_TIER;

pub const DEFAULT_AREA_M2: f64 = 84.0;
pub const AREA_CEILING_M2: f64 = 990.0;
const ABNORMAL_PERCENT: f64 = 500.0;

const CURRENT_PERCENT_FORMULA: &str = "현재백분율 = 현재단가 / 적정단가 * 100";

/// Blend weights and single-source multipliers of the fair unit price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationWeights {
    pub trade_weight: f64,
    pub public_weight: f64,
    pub trade_only_factor: f64,
    pub public_only_factor: f64,
}

impl Default for ValuationWeights {
    fn default() -> Self {
        Self {
            trade_weight: 0.6,
            public_weight: 0.4,
            trade_only_factor: 0.9,
            public_only_factor: 1.5,
        }
    }
}

/// Amounts as fetched: a total trade price and an assessed price per m².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawValuationInput {
    pub area_m2: f64,
    pub recent_trade_price_won: Option<f64>,
    pub public_price_per_m2: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValuationInput {
    pub area_m2: f64,
    pub recent_trade_unit_price: Option<i64>,
    pub public_based_unit_price: Option<i64>,
}

impl ValuationInput {
    /// Converts amounts to unit prices over the area the engine will use.
    /// Non-positive or non-finite amounts count as absent.
    pub fn from_raw(raw: &RawValuationInput) -> Self {
        let (area, _) = sanitize_area(raw.area_m2);
        Self {
            area_m2: raw.area_m2,
            recent_trade_unit_price: positive(raw.recent_trade_price_won)
                .map(|amount| (amount / area).round() as i64),
            public_based_unit_price: positive(raw.public_price_per_m2)
                .map(|price| price.round() as i64),
        }
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationTier {
    Blended,
    TradeOnly,
    PublicOnly,
    Unavailable,
}

impl ValuationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValuationTier::Blended => "blended",
            ValuationTier::TradeOnly => "trade_only",
            ValuationTier::PublicOnly => "public_only",
            ValuationTier::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationResult {
    pub area_m2: f64,
    pub recent_trade_unit_price: Option<i64>,
    pub public_based_unit_price: Option<i64>,
    pub fair_unit_price: Option<i64>,
    pub current_unit_price: Option<i64>,
    pub current_percent: Option<f64>,
    pub estimated_value: Option<i64>,
    pub formula_description: String,
    pub tier: ValuationTier,
    pub cautions: Vec<String>,
}

impl ValuationResult {
    /// Replaces the fair unit price and current percent with user-chosen
    /// values, re-deriving the estimate from the stored area.
    pub fn adjusted(&self, current_percent: f64, fair_unit_price: i64) -> Self {
        Self {
            fair_unit_price: Some(fair_unit_price),
            current_percent: Some(round1(current_percent)),
            estimated_value: Some((fair_unit_price as f64 * self.area_m2).round() as i64),
            ..self.clone()
        }
    }
}

/// First positive, finite candidate in precedence order: the matched trade's
/// area, the building's representative unit area, then the caller's value.
pub fn select_area(
    trade_area: Option<f64>,
    representative_area: Option<f64>,
    requested_area: Option<f64>,
) -> f64 {
    [trade_area, representative_area, requested_area]
        .into_iter()
        .find_map(positive)
        .unwrap_or(DEFAULT_AREA_M2)
}

fn sanitize_area(area: f64) -> (f64, Option<String>) {
    if !area.is_finite() || area <= 0.0 {
        (
            DEFAULT_AREA_M2,
            Some("면적 정보가 유효하지 않아 기본 면적(84㎡)을 적용했습니다.".to_string()),
        )
    } else if area > AREA_CEILING_M2 {
        (
            DEFAULT_AREA_M2,
            Some(format!(
                "면적 값({area}㎡)이 단일 주거 면적으로 보기 어려워 기본 면적(84㎡)으로 대체했습니다. 데이터 확인이 필요합니다."
            )),
        )
    } else {
        (area, None)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Computes the fair unit price by tier and the values derived from it.
/// Every input yields a complete result; missing data shows up as nulls
/// plus cautions.
pub fn compute_valuation(input: &ValuationInput, weights: &ValuationWeights) -> ValuationResult {
    let mut cautions = Vec::new();

    let (area_m2, area_caution) = sanitize_area(input.area_m2);
    if let Some(caution) = area_caution {
        tracing::warn!(area_m2 = input.area_m2, "Suspicious area replaced with default");
        cautions.push(caution);
    }

    let trade = input.recent_trade_unit_price.filter(|p| *p > 0);
    let public = input.public_based_unit_price.filter(|p| *p > 0);

    let (tier, fair_unit_price, mut formula_description) = match (trade, public) {
        (Some(trade), Some(public)) => (
            ValuationTier::Blended,
            Some(
                (trade as f64 * weights.trade_weight + public as f64 * weights.public_weight)
                    .round() as i64,
            ),
            format!(
                "적정단가 = (최근실거래가 단가 * {}) + (공시지가 기반 단가 * {})",
                weights.trade_weight, weights.public_weight
            ),
        ),
        (Some(trade), None) => {
            cautions.push(format!(
                "공시지가 데이터 확인 불가로 실거래가 기반 추정치입니다. (실거래가 × {})",
                weights.trade_only_factor
            ));
            (
                ValuationTier::TradeOnly,
                Some((trade as f64 * weights.trade_only_factor).round() as i64),
                format!("적정단가 = 최근실거래가 단가 * {}", weights.trade_only_factor),
            )
        }
        (None, Some(public)) => {
            cautions.push(format!(
                "실거래가 데이터 확인 불가로 공시지가 기반 추정치입니다. (공시지가 × {})",
                weights.public_only_factor
            ));
            (
                ValuationTier::PublicOnly,
                Some((public as f64 * weights.public_only_factor).round() as i64),
                format!("적정단가 = 공시지가 기반 단가 * {}", weights.public_only_factor),
            )
        }
        (None, None) => {
            cautions
                .push("실거래가 및 공시지가 데이터가 모두 부족하여 가치 산출이 불가능합니다.".to_string());
            (
                ValuationTier::Unavailable,
                None,
                "데이터 부족으로 산출 불가".to_string(),
            )
        }
    };

    let current_unit_price = trade;
    let current_percent = match (current_unit_price, fair_unit_price) {
        (Some(current), Some(fair)) if fair > 0 => {
            Some(round1(current as f64 / fair as f64 * 100.0))
        }
        _ => None,
    };
    let estimated_value = fair_unit_price.map(|fair| (fair as f64 * area_m2).round() as i64);

    if current_percent.is_some() {
        formula_description.push('\n');
        formula_description.push_str(CURRENT_PERCENT_FORMULA);
    }

    if let Some(percent) = current_percent.filter(|p| *p > ABNORMAL_PERCENT) {
        tracing::warn!(current_percent = percent, "Abnormal valuation percent");
        cautions.push("산출된 백분율이 비정상적으로 높습니다. 데이터 오류 가능성이 있습니다.".to_string());
    }

    VALUATION_TIER.add(1, &[KeyValue::new("valuation.tier", tier.as_str())]);

    ValuationResult {
        area_m2,
        recent_trade_unit_price: trade,
        public_based_unit_price: public,
        fair_unit_price,
        current_unit_price,
        current_percent,
        estimated_value,
        formula_description,
        tier,
        cautions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(area: f64, trade: Option<f64>, public: Option<f64>) -> ValuationResult {
        let input = ValuationInput::from_raw(&RawValuationInput {
            area_m2: area,
            recent_trade_price_won: trade,
            public_price_per_m2: public,
        });
        compute_valuation(&input, &ValuationWeights::default())
    }

    #[test]
    fn test_blended_reference_case() {
        let result = raw(84.0, Some(840_000_000.0), Some(6_000_000.0));

        assert_eq!(result.recent_trade_unit_price, Some(10_000_000));
        assert_eq!(result.public_based_unit_price, Some(6_000_000));
        assert_eq!(result.fair_unit_price, Some(8_400_000));
        assert_eq!(result.current_unit_price, Some(10_000_000));
        assert_eq!(result.current_percent, Some(119.0));
        assert_eq!(result.estimated_value, Some(705_600_000));
        assert_eq!(result.tier, ValuationTier::Blended);
        assert!(result.cautions.is_empty());
        assert!(
            result
                .formula_description
                .starts_with("적정단가 = (최근실거래가 단가 * 0.6) + (공시지가 기반 단가 * 0.4)")
        );
    }

    #[test]
    fn test_tier_selection() {
        let cases = vec![
            (Some(10_000_000), Some(6_000_000), ValuationTier::Blended, Some(8_400_000), 0),
            (Some(10_000_000), None, ValuationTier::TradeOnly, Some(9_000_000), 1),
            (None, Some(6_000_000), ValuationTier::PublicOnly, Some(9_000_000), 1),
            (None, None, ValuationTier::Unavailable, None, 1),
            (Some(0), Some(-5), ValuationTier::Unavailable, None, 1),
        ];

        for (trade, public, tier, fair, caution_count) in cases {
            let input = ValuationInput {
                area_m2: 84.0,
                recent_trade_unit_price: trade,
                public_based_unit_price: public,
            };
            let result = compute_valuation(&input, &ValuationWeights::default());
            assert_eq!(result.tier, tier, "inputs {trade:?} {public:?}");
            assert_eq!(result.fair_unit_price, fair, "inputs {trade:?} {public:?}");
            assert_eq!(result.cautions.len(), caution_count, "inputs {trade:?} {public:?}");
        }
    }

    #[test]
    fn test_neither_input_has_single_caution() {
        let result = raw(84.0, None, None);

        assert_eq!(result.fair_unit_price, None);
        assert_eq!(result.current_percent, None);
        assert_eq!(result.estimated_value, None);
        assert_eq!(result.formula_description, "데이터 부족으로 산출 불가");
        assert_eq!(
            result.cautions,
            vec!["실거래가 및 공시지가 데이터가 모두 부족하여 가치 산출이 불가능합니다."]
        );
    }

    #[test]
    fn test_trade_only_percent() {
        let result = raw(84.0, Some(840_000_000.0), None);

        assert_eq!(result.fair_unit_price, Some(9_000_000));
        assert_eq!(result.current_percent, Some(111.1));
        assert_eq!(result.estimated_value, Some(756_000_000));
        assert!(result.cautions[0].contains("실거래가 × 0.9"));
    }

    #[test]
    fn test_public_only_has_no_percent() {
        let result = raw(84.0, None, Some(6_000_000.4));

        assert_eq!(result.public_based_unit_price, Some(6_000_000));
        assert_eq!(result.fair_unit_price, Some(9_000_000));
        assert_eq!(result.current_unit_price, None);
        assert_eq!(result.current_percent, None);
        assert!(!result.formula_description.contains("현재백분율"));
    }

    #[test]
    fn test_area_anomalies_fall_back_to_default() {
        let cases = vec![0.0, -12.0, f64::NAN, f64::INFINITY, 1500.0];

        for area in cases {
            let result = raw(area, Some(840_000_000.0), Some(6_000_000.0));
            assert_eq!(result.area_m2, DEFAULT_AREA_M2, "area {area}");
            assert_eq!(result.recent_trade_unit_price, Some(10_000_000), "area {area}");
            assert_eq!(result.cautions.len(), 1, "area {area}");
        }
    }

    #[test]
    fn test_area_at_ceiling_is_kept() {
        let result = raw(990.0, None, Some(1_000_000.0));
        assert_eq!(result.area_m2, 990.0);
        assert_eq!(result.estimated_value, Some(1_485_000_000));
    }

    #[test]
    fn test_abnormal_percent_is_flagged_not_rejected() {
        let input = ValuationInput {
            area_m2: 84.0,
            recent_trade_unit_price: Some(100_000_000),
            public_based_unit_price: Some(1_000),
        };
        let weights = ValuationWeights {
            trade_weight: 0.1,
            public_weight: 0.9,
            ..ValuationWeights::default()
        };

        let result = compute_valuation(&input, &weights);
        assert!(result.current_percent.unwrap() > 500.0);
        assert_eq!(result.cautions.len(), 1);
        assert!(result.cautions[0].contains("데이터 오류"));
    }

    #[test]
    fn test_configured_multipliers() {
        let weights = ValuationWeights {
            trade_only_factor: 0.8,
            public_only_factor: 2.0,
            ..ValuationWeights::default()
        };
        let trade_only = ValuationInput {
            area_m2: 84.0,
            recent_trade_unit_price: Some(10_000_000),
            public_based_unit_price: None,
        };
        let public_only = ValuationInput {
            recent_trade_unit_price: None,
            public_based_unit_price: Some(5_000_000),
            ..trade_only
        };

        assert_eq!(compute_valuation(&trade_only, &weights).fair_unit_price, Some(8_000_000));
        assert_eq!(compute_valuation(&public_only, &weights).fair_unit_price, Some(10_000_000));
    }

    #[test]
    fn test_select_area_precedence() {
        let cases = vec![
            ((Some(84.97), Some(59.9), Some(100.0)), 84.97),
            ((None, Some(59.9), Some(100.0)), 59.9),
            ((Some(0.0), None, Some(100.0)), 100.0),
            ((None, Some(f64::NAN), None), DEFAULT_AREA_M2),
            ((None, None, None), DEFAULT_AREA_M2),
        ];

        for ((trade, repr, requested), expected) in cases {
            assert_eq!(select_area(trade, repr, requested), expected);
        }
    }

    #[test]
    fn test_adjusted_rederives_estimate() {
        let result = raw(84.0, Some(840_000_000.0), Some(6_000_000.0));
        let adjusted = result.adjusted(105.04, 9_000_000);

        assert_eq!(adjusted.fair_unit_price, Some(9_000_000));
        assert_eq!(adjusted.current_percent, Some(105.0));
        assert_eq!(adjusted.estimated_value, Some(756_000_000));
        assert_eq!(adjusted.recent_trade_unit_price, result.recent_trade_unit_price);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let value = serde_json::to_value(raw(84.0, None, None)).unwrap();
        assert!(value.get("fairUnitPrice").unwrap().is_null());
        assert!(value.get("areaM2").is_some());
        assert!(value.get("formulaDescription").is_some());
    }
}
