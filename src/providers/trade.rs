use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Months, NaiveDate};
use regex::Regex;
use serde::Serialize;

use super::{Providers, UpstreamError, build_url, normalize_code};

pub const TRADE_ENDPOINT: &str =
    "https://apis.data.go.kr/1613000/RTMSDataSvcAptTrade/getRTMSDataSvcAptTrade";

const PROVIDER: &str = "molit_apt_trade";
const DEFAULT_LAWD_CD: &str = "11680";
const CANDIDATE_WINDOW: usize = 10;

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<item>(.*?)</item>").expect("valid item regex"));
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(\w+)>\s*([^<]*?)\s*</(\w+)>").expect("valid field regex")
});

/// One apartment trade from the transaction registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub amount_won: i64,
    pub deal_date: NaiveDate,
    pub floor: Option<i32>,
    pub exclusive_area_m2: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apt_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dong: Option<String>,
}

/// Parses the registry XML into trades, newest first. Items missing an
/// amount, a date or an area are skipped.
pub fn parse_trades(xml: &str) -> Vec<Trade> {
    let mut trades: Vec<Trade> = ITEM_RE
        .captures_iter(xml)
        .filter_map(|cap| parse_item(cap.get(1)?.as_str()))
        .collect();

    trades.sort_by(|a, b| b.deal_date.cmp(&a.deal_date));
    trades
}

fn parse_item(item: &str) -> Option<Trade> {
    let fields: HashMap<&str, &str> = FIELD_RE
        .captures_iter(item)
        .filter_map(|cap| {
            let open = cap.get(1)?.as_str();
            let close = cap.get(3)?.as_str();
            (open == close).then(|| (open, cap.get(2).map_or("", |m| m.as_str())))
        })
        .collect();

    let amount_man_won: i64 = fields
        .get("dealAmount")?
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;

    let year: i32 = fields.get("dealYear")?.parse().ok()?;
    let month: u32 = fields.get("dealMonth")?.parse().ok()?;
    let day: u32 = fields.get("dealDay")?.parse().ok()?;
    let deal_date = NaiveDate::from_ymd_opt(year, month, day)?;

    let exclusive_area_m2: f64 = fields.get("excluUseAr")?.parse().ok()?;
    if !exclusive_area_m2.is_finite() || exclusive_area_m2 <= 0.0 {
        return None;
    }

    Some(Trade {
        amount_won: amount_man_won * 10_000,
        deal_date,
        floor: fields.get("floor").and_then(|f| f.parse().ok()),
        exclusive_area_m2,
        apt_name: text_field(&fields, "aptNm"),
        dong: text_field(&fields, "umdNm"),
    })
}

fn text_field(fields: &HashMap<&str, &str>, name: &str) -> Option<String> {
    let value = fields.get(name)?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Among the most recent trades, picks the one whose area is closest to the
/// target. Without a usable target the newest trade wins.
pub fn pick_closest_trade(trades: &[Trade], target_area: Option<f64>) -> Option<&Trade> {
    let recent = &trades[..trades.len().min(CANDIDATE_WINDOW)];
    let newest = recent.first()?;

    let Some(target) = target_area.filter(|a| a.is_finite() && *a > 0.0) else {
        return Some(newest);
    };

    let mut best = newest;
    let mut best_diff = f64::INFINITY;
    for trade in recent {
        let diff = (trade.exclusive_area_m2 - target).abs();
        if diff < best_diff {
            best_diff = diff;
            best = trade;
        }
    }
    Some(best)
}

pub fn normalize_lawd_cd(value: Option<&str>) -> String {
    normalize_code(value, 5).unwrap_or_else(|| DEFAULT_LAWD_CD.to_string())
}

/// `YYYYMM` as given, or the month before `today`.
pub fn normalize_deal_ymd(value: Option<&str>, today: NaiveDate) -> String {
    if let Some(ymd) = normalize_code(value, 6) {
        return ymd;
    }
    today
        .checked_sub_months(Months::new(1))
        .unwrap_or(today)
        .format("%Y%m")
        .to_string()
}

pub async fn fetch_trades(
    providers: &Providers,
    service_key: &str,
    lawd_cd: &str,
    deal_ymd: &str,
) -> Result<Vec<Trade>, UpstreamError> {
    fetch_trade_page(providers, service_key, lawd_cd, deal_ymd, 50).await
}

/// One registry page of up to `rows` trades for a district and month.
#[tracing::instrument(
    name = "provider trade",
    skip(providers, service_key),
    fields(trade.count)
)]
pub async fn fetch_trade_page(
    providers: &Providers,
    service_key: &str,
    lawd_cd: &str,
    deal_ymd: &str,
    rows: u32,
) -> Result<Vec<Trade>, UpstreamError> {
    let rows = rows.to_string();
    let url = build_url(
        PROVIDER,
        TRADE_ENDPOINT,
        &[
            ("serviceKey", service_key),
            ("LAWD_CD", lawd_cd),
            ("DEAL_YMD", deal_ymd),
            ("pageNo", "1"),
            ("numOfRows", &rows),
        ],
    )?;

    let xml = providers
        .client
        .fetch_text(PROVIDER, url, &[], providers.with_retry(providers.trade_timeout))
        .await?;

    let trades = parse_trades(&xml);
    tracing::Span::current().record("trade.count", trades.len());
    if trades.is_empty() {
        tracing::warn!(lawd_cd, deal_ymd, "Trade registry returned no usable items");
    }

    Ok(trades)
}
