use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::trace::TraceContextExt;
use serde::Deserialize;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::AppState;
use crate::db::ReportRecord;
use crate::entitlement::EntitlementState;
use crate::error::{AppError, AppResult};
use crate::providers::building::{BuildingSpecs, ParcelCodes, fetch_building};
use crate::providers::land::{
    Coordinates, LandInfo, PublicLandPrice, fetch_land_info, fetch_public_price, geocode,
};
use crate::providers::listing::{ComplexSummary, crawl_listings};
use crate::providers::news::{NewsItem, SearchSort, sanitize_query, search_news};
use crate::providers::trade::{
    Trade, fetch_trades, normalize_deal_ymd, normalize_lawd_cd, pick_closest_trade,
};
use crate::providers::{Providers, mask_address};
use crate::telemetry::metrics::{REPORT_GENERATION_DURATION, REPORT_SOURCE_FACTS};

use super::sources::{SourceBundle, aggregate};
use super::synthesize::{AnalysisDepth, Synthesizer};
use super::valuation::{
    RawValuationInput, ValuationInput, ValuationWeights, compute_valuation, select_area,
};

const MIN_ADDRESS_CHARS: usize = 2;
const MAX_ADDRESS_CHARS: usize = 120;
const NEWS_DISPLAY: u32 = 10;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub address: String,
    #[serde(default)]
    pub analysis_depth: Option<AnalysisDepth>,
    pub lawd_cd: Option<String>,
    pub deal_ymd: Option<String>,
    pub sigungu_cd: Option<String>,
    pub bjdong_cd: Option<String>,
    pub bun: Option<String>,
    pub ji: Option<String>,
    pub pnu: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub area_m2: Option<f64>,
}

impl ReportRequest {
    /// Trimmed subject address, 2 to 120 characters.
    pub fn subject(&self) -> AppResult<&str> {
        let address = self.address.trim();
        let len = address.chars().count();
        if !(MIN_ADDRESS_CHARS..=MAX_ADDRESS_CHARS).contains(&len) {
            return Err(AppError::InvalidInput(format!(
                "address must be {MIN_ADDRESS_CHARS} to {MAX_ADDRESS_CHARS} characters"
            )));
        }
        Ok(address)
    }
}

/// Registry credentials report generation cannot run without.
pub fn registry_keys(providers: &Providers) -> AppResult<(&str, &str)> {
    let gov_data_key = providers
        .gov_data_key
        .as_deref()
        .ok_or_else(|| AppError::ConfigMissing("GOV_DATA_KEY".into()))?;
    let vworld_key = providers
        .vworld_key
        .as_deref()
        .ok_or_else(|| AppError::ConfigMissing("VWORLD_KEY".into()))?;
    Ok((gov_data_key, vworld_key))
}

/// Provider payloads for one subject. Every fetch that failed is absent.
#[derive(Debug, Default)]
pub struct Collected {
    pub trades: Vec<Trade>,
    pub building: Option<BuildingSpecs>,
    pub land: Option<LandInfo>,
    pub public_price: Option<PublicLandPrice>,
    pub news: Vec<NewsItem>,
    pub news_query: String,
    pub listings: Vec<ComplexSummary>,
}

fn absent<T>(provider: &str, subject: &str, result: Result<T, impl std::fmt::Display>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(
                provider,
                subject = %mask_address(subject),
                error = %e,
                "Provider fetch failed, continuing without it"
            );
            None
        }
    }
}

#[tracing::instrument(
    name = "pipeline_stage collect",
    skip_all,
    fields(pipeline.stage = "collect", collect.trades, collect.news, collect.listings)
)]
async fn collect(
    providers: &Providers,
    gov_data_key: &str,
    vworld_key: &str,
    subject: &str,
    request: &ReportRequest,
) -> Collected {
    let coords = match Coordinates::new(request.lat, request.lng) {
        Some(coords) => Some(coords),
        None => absent("geocode", subject, geocode(providers, vworld_key, subject).await).flatten(),
    };

    let lawd_cd = normalize_lawd_cd(request.lawd_cd.as_deref());
    let deal_ymd = normalize_deal_ymd(request.deal_ymd.as_deref(), Utc::now().date_naive());
    let codes = ParcelCodes::from_request(
        request.sigungu_cd.as_deref(),
        request.bjdong_cd.as_deref(),
        request.bun.as_deref(),
        request.ji.as_deref(),
    );
    let pnu = request.pnu.as_deref();

    let news_query = match sanitize_query(subject) {
        Ok(query) => Some(query),
        Err(e) => {
            tracing::debug!(error = %e, "Subject is not a usable news query, skipping news");
            None
        }
    };

    let news = async {
        match (&providers.naver, &news_query) {
            (Some(creds), Some(query)) => {
                search_news(providers, creds, query, NEWS_DISPLAY, SearchSort::Sim).await
            }
            _ => Ok(Vec::new()),
        }
    };

    let (trades, building, land, public_price, news, listings) = tokio::join!(
        fetch_trades(providers, gov_data_key, &lawd_cd, &deal_ymd),
        fetch_building(providers, gov_data_key, &codes),
        fetch_land_info(providers, vworld_key, pnu, coords),
        fetch_public_price(providers, vworld_key, pnu, coords),
        news,
        crawl_listings(providers, subject, coords, None),
    );

    let collected = Collected {
        trades: absent("trade", subject, trades).unwrap_or_default(),
        building: absent("building", subject, building).flatten(),
        land: absent("land_info", subject, land).flatten(),
        public_price: absent("public_price", subject, public_price).flatten(),
        news: absent("news", subject, news).unwrap_or_default(),
        news_query: news_query.unwrap_or_default(),
        listings: absent("listing", subject, listings).unwrap_or_default(),
    };

    let span = tracing::Span::current();
    span.record("collect.trades", collected.trades.len());
    span.record("collect.news", collected.news.len());
    span.record("collect.listings", collected.listings.len());

    collected
}

/// Values the subject, aggregates its facts and synthesizes the draft.
/// Nothing here can fail; missing data degrades into cautions and nulls.
pub async fn assemble_report(
    synthesizer: &Synthesizer,
    weights: &ValuationWeights,
    download_limit: u32,
    owner: &str,
    subject: &str,
    request: &ReportRequest,
    collected: &Collected,
) -> ReportRecord {
    let representative_area = collected
        .building
        .as_ref()
        .and_then(|b| b.representative_area_m2);
    let trade = pick_closest_trade(&collected.trades, representative_area.or(request.area_m2));

    // Stage 1: Valuation
    let raw = RawValuationInput {
        area_m2: select_area(
            trade.map(|t| t.exclusive_area_m2),
            representative_area,
            request.area_m2,
        ),
        recent_trade_price_won: trade.map(|t| t.amount_won as f64),
        public_price_per_m2: collected.public_price.as_ref().map(|p| p.price_per_m2),
    };
    let valuation = compute_valuation(&ValuationInput::from_raw(&raw), weights);

    // Stage 2: Source facts
    let facts = aggregate(&SourceBundle {
        subject,
        building: collected.building.as_ref(),
        land: collected.land.as_ref(),
        trade,
        public_price: collected.public_price.as_ref(),
        news: &collected.news,
        news_query: &collected.news_query,
        listings: &collected.listings,
        collected_at: Utc::now(),
    });

    // Stage 3: Synthesis
    let depth = request.analysis_depth.unwrap_or_default();
    let outcome = synthesizer
        .synthesize(subject, depth, &valuation, &facts)
        .await;

    ReportRecord {
        id: Uuid::new_v4(),
        owner_id: owner.to_string(),
        subject: subject.to_string(),
        analysis_depth: depth,
        valuation,
        source_facts: facts,
        draft_report: outcome.report,
        final_report: None,
        synthesis_path: outcome.path,
        adjustment: None,
        entitlement: EntitlementState::new(download_limit),
        trace_id: None,
        created_at: Utc::now(),
    }
}

#[tracing::instrument(
    name = "pipeline report",
    skip(state, owner, request),
    fields(
        report.id,
        report.facts,
        report.fallback,
        report.duration_ms,
    )
)]
pub async fn generate_report(
    state: &AppState,
    owner: &str,
    request: &ReportRequest,
) -> AppResult<ReportRecord> {
    let start = std::time::Instant::now();

    let span = tracing::Span::current();
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();
    let trace_id = span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string());

    let subject = request.subject()?;
    let (gov_data_key, vworld_key) = registry_keys(&state.providers)?;

    let collected = collect(&state.providers, gov_data_key, vworld_key, subject, request).await;

    let mut record = assemble_report(
        &state.synthesizer,
        &state.config.valuation_weights,
        state.config.report_download_limit,
        owner,
        subject,
        request,
        &collected,
    )
    .await;
    record.trace_id = trace_id;

    // Persist to database
    state.reports.insert(&record).await?;

    let duration = start.elapsed();
    let path_label = if record.synthesis_path.is_fallback() {
        "fallback"
    } else {
        "llm"
    };
    REPORT_GENERATION_DURATION.record(
        duration.as_secs_f64(),
        &[KeyValue::new("synthesis.path", path_label)],
    );
    REPORT_SOURCE_FACTS.record(record.source_facts.len() as f64, &[]);

    span.record("report.id", record.id.to_string());
    span.record("report.facts", record.source_facts.len());
    span.record("report.fallback", record.synthesis_path.is_fallback());
    span.record("report.duration_ms", duration.as_millis() as u64);

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sources::{PRICE_FACT_ID, SUBJECT_FACT_ID, TRADE_FACT_ID};
    use crate::pipeline::synthesize::{FallbackReason, SynthesisPath};
    use crate::pipeline::valuation::ValuationTier;
    use crate::providers::land::PriceLookup;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn synthesizer() -> Synthesizer {
        Synthesizer::new(None, "unused", Duration::from_millis(200))
    }

    fn trade(amount_won: i64, area: f64, day: u32) -> Trade {
        Trade {
            amount_won,
            deal_date: NaiveDate::from_ymd_opt(2026, 9, day).unwrap(),
            floor: Some(7),
            exclusive_area_m2: area,
            apt_name: None,
            dong: None,
        }
    }

    #[test]
    fn test_subject_validation() {
        let cases = vec![
            ("  역삼동 123  ", Ok("역삼동 123")),
            ("가", Err(())),
            ("   ", Err(())),
            ("가나", Ok("가나")),
        ];

        for (address, expected) in cases {
            let request = ReportRequest {
                address: address.to_string(),
                ..Default::default()
            };
            match (request.subject(), expected) {
                (Ok(got), Ok(want)) => assert_eq!(got, want),
                (Err(AppError::InvalidInput(_)), Err(())) => {}
                (got, want) => panic!("address {address:?}: got {got:?}, want {want:?}"),
            }
        }

        let long = ReportRequest {
            address: "가".repeat(121),
            ..Default::default()
        };
        assert!(long.subject().is_err());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: ReportRequest = serde_json::from_str(
            r#"{"address":"역삼동 123","analysisDepth":"premium","lawdCd":"11680","areaM2":59.9,"lat":37.5,"lng":127.03}"#,
        )
        .unwrap();
        assert_eq!(request.analysis_depth, Some(AnalysisDepth::Premium));
        assert_eq!(request.lawd_cd.as_deref(), Some("11680"));
        assert_eq!(request.area_m2, Some(59.9));
        assert_eq!(request.pnu, None);
    }

    #[tokio::test]
    async fn test_assemble_report_blends_trade_and_public_price() {
        let request = ReportRequest {
            address: "역삼동 123".to_string(),
            area_m2: Some(59.0),
            ..Default::default()
        };
        let collected = Collected {
            trades: vec![trade(1_200_000_000, 114.0, 20), trade(840_000_000, 84.0, 10)],
            building: Some(BuildingSpecs {
                representative_area_m2: Some(84.0),
                ..Default::default()
            }),
            public_price: Some(PublicLandPrice {
                price_per_m2: 6_000_000.0,
                base_year: Some(2026),
                lookup: PriceLookup::Parcel,
            }),
            ..Default::default()
        };

        let record = assemble_report(
            &synthesizer(),
            &ValuationWeights::default(),
            3,
            "user-1",
            "역삼동 123",
            &request,
            &collected,
        )
        .await;

        assert_eq!(record.valuation.area_m2, 84.0);
        assert_eq!(record.valuation.recent_trade_unit_price, Some(10_000_000));
        assert_eq!(record.valuation.public_based_unit_price, Some(6_000_000));
        assert_eq!(record.valuation.tier, ValuationTier::Blended);
        assert_eq!(record.analysis_depth, AnalysisDepth::Standard);
        assert_eq!(record.entitlement, EntitlementState::new(3));
        assert_eq!(
            record.synthesis_path,
            SynthesisPath::Fallback {
                reason: FallbackReason::NotConfigured
            }
        );

        let ids: Vec<&str> = record.source_facts.iter().map(|f| f.id.as_str()).collect();
        assert!(ids.contains(&TRADE_FACT_ID));
        assert!(ids.contains(&PRICE_FACT_ID));
    }

    #[tokio::test]
    async fn test_assemble_report_without_data_uses_placeholder_fact() {
        let request = ReportRequest {
            address: "역삼동 123".to_string(),
            analysis_depth: Some(AnalysisDepth::Basic),
            ..Default::default()
        };

        let record = assemble_report(
            &synthesizer(),
            &ValuationWeights::default(),
            3,
            "user-1",
            "역삼동 123",
            &request,
            &Collected::default(),
        )
        .await;

        assert_eq!(record.valuation.tier, ValuationTier::Unavailable);
        assert_eq!(record.valuation.fair_unit_price, None);
        assert_eq!(record.source_facts.len(), 1);
        assert_eq!(record.source_facts[0].id, SUBJECT_FACT_ID);
        assert!(record.synthesis_path.is_fallback());
        assert!(!record.draft_report.summary.is_empty());
    }
}
