use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::providers::trade::{Trade, fetch_trade_page};
use crate::providers::{Providers, normalize_code};

const AREA_TOLERANCE: f64 = 0.2;
const LOOKBACK_MONTHS: u32 = 3;
const PAGE_ROWS: u32 = 100;
const MAX_LISTED: usize = 10;
const UNKNOWN_COMPLEX: &str = "알 수 없음";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    #[serde(default)]
    pub address: String,
    pub lawd_cd: Option<String>,
    pub target_area_m2: Option<f64>,
    pub target_unit_price: Option<f64>,
    pub deal_ymd: Option<String>,
}

impl CompareRequest {
    /// District code and target area, both required.
    pub fn target(&self) -> AppResult<(String, f64)> {
        let lawd_cd = normalize_code(self.lawd_cd.as_deref(), 5);
        let area = self.target_area_m2.filter(|a| a.is_finite() && *a > 0.0);
        match (lawd_cd, area) {
            (Some(lawd_cd), Some(area)) => Ok((lawd_cd, area)),
            _ => Err(AppError::InvalidInput(
                "lawdCd와 targetAreaM2가 필요합니다.".to_string(),
            )),
        }
    }

    /// A zero or missing unit price means no target to rank.
    pub fn unit_price(&self) -> Option<f64> {
        self.target_unit_price.filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparable {
    pub address: String,
    pub apt_name: String,
    pub area_m2: f64,
    pub floor: Option<i32>,
    pub amount_won: i64,
    pub unit_price: i64,
    pub trade_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonStats {
    pub count: usize,
    pub avg_unit_price: i64,
    pub min_unit_price: i64,
    pub max_unit_price: i64,
    pub median_unit_price: i64,
    pub percentile: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProperty {
    pub address: String,
    pub area_m2: f64,
    pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub target_property: TargetProperty,
    pub comparisons: Vec<Comparable>,
    pub statistics: ComparisonStats,
    pub recommendation: String,
}

/// Trades within 20% of the target area either way, newest first.
pub fn comparables(trades: &[Trade], target_area: f64) -> Vec<Comparable> {
    let lower = target_area * (1.0 - AREA_TOLERANCE);
    let upper = target_area * (1.0 + AREA_TOLERANCE);

    let mut found: Vec<Comparable> = trades
        .iter()
        .filter(|t| t.amount_won > 0 && (lower..=upper).contains(&t.exclusive_area_m2))
        .map(|t| Comparable {
            address: t.dong.clone().unwrap_or_default(),
            apt_name: t.apt_name.clone().unwrap_or_else(|| UNKNOWN_COMPLEX.to_string()),
            area_m2: t.exclusive_area_m2,
            floor: t.floor,
            amount_won: t.amount_won,
            unit_price: (t.amount_won as f64 / t.exclusive_area_m2).round() as i64,
            trade_date: t.deal_date,
        })
        .collect();

    found.sort_by(|a, b| b.trade_date.cmp(&a.trade_date));
    found
}

fn median(sorted: &[i64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2] as f64,
        _ => (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0,
    }
}

/// Share of comparables priced strictly below `value`, in whole percent.
/// An empty set ranks everything at 50.
pub fn percentile_rank(unit_prices: &[i64], value: f64) -> u32 {
    if unit_prices.is_empty() {
        return 50;
    }
    let below = unit_prices.iter().filter(|p| (**p as f64) < value).count();
    (below as f64 / unit_prices.len() as f64 * 100.0).round() as u32
}

pub fn statistics(unit_prices: &[i64], target_unit_price: Option<f64>) -> ComparisonStats {
    let mut sorted = unit_prices.to_vec();
    sorted.sort_unstable();

    let count = sorted.len();
    let avg_unit_price = match count {
        0 => 0,
        _ => (sorted.iter().sum::<i64>() as f64 / count as f64).round() as i64,
    };

    ComparisonStats {
        count,
        avg_unit_price,
        min_unit_price: sorted.first().copied().unwrap_or(0),
        max_unit_price: sorted.last().copied().unwrap_or(0),
        median_unit_price: median(&sorted).round() as i64,
        percentile: target_unit_price.map(|price| percentile_rank(&sorted, price)),
    }
}

pub fn recommendation(stats: &ComparisonStats) -> &'static str {
    match (stats.count, stats.percentile) {
        (0, _) => "유사 물건 거래 이력이 부족합니다. 인근 지역을 확대하여 조사를 권장합니다.",
        (_, None) => "",
        (_, Some(p)) if p < 25 => "비교군 대비 저렴한 편입니다. 추가 조사를 권장합니다.",
        (_, Some(p)) if p < 50 => "비교군 평균 이하 가격대입니다.",
        (_, Some(p)) if p < 75 => "비교군 평균 수준의 가격대입니다.",
        _ => "비교군 대비 높은 가격대입니다. 프리미엄 요소를 확인하세요.",
    }
}

/// Three consecutive `YYYYMM` months from `deal_ymd`, or from three months
/// before `today`.
pub fn lookup_months(deal_ymd: Option<&str>, today: NaiveDate) -> Vec<String> {
    let start = normalize_code(deal_ymd, 6)
        .and_then(|ymd| NaiveDate::parse_from_str(&format!("{ymd}01"), "%Y%m%d").ok())
        .or_else(|| {
            today
                .with_day0(0)
                .and_then(|first| first.checked_sub_months(Months::new(LOOKBACK_MONTHS)))
        })
        .unwrap_or(today);

    (0..LOOKBACK_MONTHS)
        .filter_map(|i| start.checked_add_months(Months::new(i)))
        .map(|month| month.format("%Y%m").to_string())
        .collect()
}

pub fn summarize(request: &CompareRequest, target_area: f64, found: Vec<Comparable>) -> ComparisonResult {
    let unit_prices: Vec<i64> = found.iter().map(|c| c.unit_price).collect();
    let target_unit_price = request.unit_price();
    let statistics = statistics(&unit_prices, target_unit_price);
    let recommendation = recommendation(&statistics).to_string();

    ComparisonResult {
        target_property: TargetProperty {
            address: request.address.trim().to_string(),
            area_m2: target_area,
            unit_price: target_unit_price,
        },
        comparisons: found.into_iter().take(MAX_LISTED).collect(),
        statistics,
        recommendation,
    }
}

async fn fetch_month(providers: &Providers, service_key: &str, lawd_cd: &str, deal_ymd: &str) -> Vec<Trade> {
    match fetch_trade_page(providers, service_key, lawd_cd, deal_ymd, PAGE_ROWS).await {
        Ok(trades) => trades,
        Err(e) => {
            tracing::warn!(deal_ymd, error = %e, "Comparable month unavailable");
            Vec::new()
        }
    }
}

/// Gathers trades of similar area over three months and ranks the target
/// unit price against them. A month that fails to load is skipped.
#[tracing::instrument(
    name = "pipeline comparables",
    skip(providers, request),
    fields(comparables.count)
)]
pub async fn compare_properties(
    providers: &Providers,
    request: &CompareRequest,
    today: NaiveDate,
) -> AppResult<ComparisonResult> {
    let (lawd_cd, target_area) = request.target()?;
    let service_key = providers
        .gov_data_key
        .as_deref()
        .ok_or_else(|| AppError::ConfigMissing("GOV_DATA_KEY".into()))?;

    let months = lookup_months(request.deal_ymd.as_deref(), today);
    let mut trades = Vec::new();
    for month in &months {
        trades.extend(fetch_month(providers, service_key, &lawd_cd, month).await);
    }

    let found = comparables(&trades, target_area);
    tracing::Span::current().record("comparables.count", found.len());
    tracing::info!(lawd_cd, months = ?months, found = found.len(), "Comparables collected");

    Ok(summarize(request, target_area, found))
}
