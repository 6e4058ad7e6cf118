use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use super::{FetchPolicy, Providers, UpstreamError, as_f64, as_text, build_url, item_list, normalize_code};

pub const TITLE_ENDPOINT: &str = "https://apis.data.go.kr/1613000/BldRgstHubService/getBrTitleInfo";
pub const UNIT_AREA_ENDPOINT: &str =
    "https://apis.data.go.kr/1613000/BldRgstHubService/getBrExposPubuseAreaInfo";

const PROVIDER: &str = "building_registry";

/// Lot address in the registry's code form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelCodes {
    pub sigungu_cd: String,
    pub bjdong_cd: String,
    pub bun: String,
    pub ji: String,
}

impl ParcelCodes {
    pub fn from_request(
        sigungu_cd: Option<&str>,
        bjdong_cd: Option<&str>,
        bun: Option<&str>,
        ji: Option<&str>,
    ) -> Self {
        Self {
            sigungu_cd: normalize_code(sigungu_cd, 5).unwrap_or_else(|| "11680".to_string()),
            bjdong_cd: normalize_code(bjdong_cd, 5).unwrap_or_else(|| "10300".to_string()),
            bun: normalize_code(bun, 4).unwrap_or_else(|| "0001".to_string()),
            ji: normalize_code(ji, 4).unwrap_or_else(|| "0000".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildingSpecs {
    pub total_area_m2: Option<f64>,
    pub ground_floors: Option<u32>,
    pub structure: Option<String>,
    pub built_year: Option<i32>,
    pub representative_area_m2: Option<f64>,
}

fn registry_items(json: &Value) -> Vec<&Value> {
    item_list(json.pointer("/response/body/items/item"))
}

/// First title record of the building registry.
pub fn parse_title_info(json: &Value) -> Option<BuildingSpecs> {
    let item = *registry_items(json).first()?;

    let total_area_m2 = as_f64(item.get("totArea"))
        .filter(|a| *a > 0.0)
        .or_else(|| as_f64(item.get("archArea")).filter(|a| *a > 0.0));

    let built_year = as_text(item.get("useAprDay"))
        .or_else(|| as_text(item.get("crtnDay")))
        .and_then(|day| day.get(..4).and_then(|y| y.parse::<i32>().ok()))
        .filter(|year| *year > 1800);

    Some(BuildingSpecs {
        total_area_m2,
        ground_floors: as_f64(item.get("grndFlrCnt"))
            .filter(|f| *f > 0.0)
            .map(|f| f as u32),
        structure: as_text(item.get("strctCdNm")),
        built_year,
        representative_area_m2: None,
    })
}

/// Most frequent unit area, rounded to 0.1 m². Exclusive-use rows are
/// preferred when the listing has any; on ties the earliest value to reach
/// the top count wins.
pub fn representative_area(json: &Value) -> Option<f64> {
    let items = registry_items(json);
    let exclusive: Vec<&Value> = items
        .iter()
        .copied()
        .filter(|item| as_text(item.get("exposPubuseGbCd")).as_deref() == Some("1"))
        .collect();
    let candidates = if exclusive.is_empty() { items } else { exclusive };

    let mut frequency: HashMap<i64, u32> = HashMap::new();
    let mut best: Option<(i64, u32)> = None;

    for item in candidates {
        let area = as_f64(item.get("area"))
            .filter(|a| *a > 0.0)
            .or_else(|| as_f64(item.get("exposPubuseArea")).filter(|a| *a > 0.0));
        let Some(area) = area else { continue };

        let tenths = (area * 10.0).round() as i64;
        let count = frequency.entry(tenths).or_insert(0);
        *count += 1;

        if best.is_none_or(|(_, max)| *count > max) {
            best = Some((tenths, *count));
        }
    }

    best.map(|(tenths, _)| tenths as f64 / 10.0)
}

#[tracing::instrument(
    name = "provider building",
    skip(providers, service_key),
    fields(building.found, building.representative_area)
)]
pub async fn fetch_building(
    providers: &Providers,
    service_key: &str,
    codes: &ParcelCodes,
) -> Result<Option<BuildingSpecs>, UpstreamError> {
    let title_url = build_url(
        PROVIDER,
        TITLE_ENDPOINT,
        &[
            ("serviceKey", service_key),
            ("sigunguCd", &codes.sigungu_cd),
            ("bjdongCd", &codes.bjdong_cd),
            ("bun", &codes.bun),
            ("ji", &codes.ji),
            ("numOfRows", "1"),
            ("_type", "json"),
        ],
    )?;
    let unit_url = build_url(
        PROVIDER,
        UNIT_AREA_ENDPOINT,
        &[
            ("serviceKey", service_key),
            ("sigunguCd", &codes.sigungu_cd),
            ("bjdongCd", &codes.bjdong_cd),
            ("bun", &codes.bun),
            ("ji", &codes.ji),
            ("numOfRows", "500"),
            ("_type", "json"),
        ],
    )?;

    // The registry portal is slow; the title lookup gets the long bound.
    let title_policy = FetchPolicy {
        timeout: providers.trade_timeout,
        retries: 0,
        backoff: providers.backoff,
    };

    let (title, units) = tokio::join!(
        providers.client.fetch_json(PROVIDER, title_url, &[], title_policy),
        providers
            .client
            .fetch_json(PROVIDER, unit_url, &[], providers.single_attempt()),
    );

    let representative = match units {
        Ok(json) => representative_area(&json),
        Err(err) => {
            tracing::warn!(error = %err, "Unit area listing unavailable");
            None
        }
    };

    let specs = match title {
        Ok(json) => parse_title_info(&json),
        Err(err) if representative.is_some() => {
            tracing::warn!(error = %err, "Building title unavailable, keeping unit areas");
            Some(BuildingSpecs::default())
        }
        Err(err) => return Err(err),
    };

    let specs = match (specs, representative) {
        (Some(mut specs), area) => {
            specs.representative_area_m2 = area;
            Some(specs)
        }
        (None, Some(area)) => Some(BuildingSpecs {
            representative_area_m2: Some(area),
            ..BuildingSpecs::default()
        }),
        (None, None) => None,
    };

    let span = tracing::Span::current();
    span.record("building.found", specs.is_some());
    if let Some(area) = representative {
        span.record("building.representative_area", area);
    }

    Ok(specs)
}
