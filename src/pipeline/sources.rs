use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::building::{BuildingSpecs, TITLE_ENDPOINT};
use crate::providers::land::{LAND_INFO_ENDPOINT, LAND_PRICE_ENDPOINT, LandInfo, PublicLandPrice};
use crate::providers::listing::{ComplexSummary, LISTING_SOURCE_URL};
use crate::providers::news::{NEWS_ENDPOINT, NewsItem};
use crate::providers::trade::{TRADE_ENDPOINT, Trade};

pub const BUILDING_FACT_ID: &str = "public_building_ledger";
pub const LAND_FACT_ID: &str = "vworld_land_info";
pub const TRADE_FACT_ID: &str = "public_trade_price";
pub const PRICE_FACT_ID: &str = "vworld_public_price";
pub const NEWS_DIGEST_ID: &str = "naver_news_digest";
pub const NEWS_ARTICLE_PREFIX: &str = "naver_news_";
pub const LISTING_FACT_ID: &str = "naver_land_summary";
pub const SUBJECT_FACT_ID: &str = "subject_input";

const MAX_NEWS_ITEMS: usize = 5;
const MAP_SEARCH_URL: &str = "https://map.naver.com/p/search";

/// A citable unit of evidence. Ids and urls are unique within one list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFact {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl SourceFact {
    fn new(id: &str, title: &str, url: &str, summary: String) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            url: url.to_string(),
            summary: (!summary.trim().is_empty()).then_some(summary),
        }
    }

    /// `naver_news_{n}` article facts, excluding the digest.
    pub fn is_news_article(&self) -> bool {
        self.id
            .strip_prefix(NEWS_ARTICLE_PREFIX)
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    }
}

/// Everything the providers returned for one subject. Absent payloads are `None`.
#[derive(Debug, Default)]
pub struct SourceBundle<'a> {
    pub subject: &'a str,
    pub building: Option<&'a BuildingSpecs>,
    pub land: Option<&'a LandInfo>,
    pub trade: Option<&'a Trade>,
    pub public_price: Option<&'a PublicLandPrice>,
    pub news: &'a [NewsItem],
    pub news_query: &'a str,
    pub listings: &'a [ComplexSummary],
    pub collected_at: DateTime<Utc>,
}

pub(crate) fn format_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if value < 0 {
        out.insert(0, '-');
    }
    out
}

pub(crate) fn format_area(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format_thousands(rounded as i64)
    } else {
        format!("{rounded}")
    }
}

pub fn building_fact(specs: &BuildingSpecs) -> SourceFact {
    let mut lines = Vec::new();
    if let Some(area) = specs.representative_area_m2 {
        lines.push(format!("전용면적: {}㎡", format_area(area)));
    }
    if let Some(area) = specs.total_area_m2 {
        lines.push(format!("연면적: {}㎡", format_area(area)));
    }
    if let Some(structure) = &specs.structure {
        lines.push(format!("구조: {structure}"));
    }
    if let Some(floors) = specs.ground_floors {
        lines.push(format!("지상 층수: {floors}층"));
    }
    if let Some(year) = specs.built_year {
        lines.push(format!("사용승인연도: {year}년"));
    }
    SourceFact::new(BUILDING_FACT_ID, "건축물대장(공공데이터포털)", TITLE_ENDPOINT, lines.join(", "))
}

pub fn land_fact(info: &LandInfo) -> SourceFact {
    let mut lines = Vec::new();
    if let Some(category) = &info.land_category {
        lines.push(format!("지목: {category}"));
    }
    if let Some(area) = info.parcel_area_m2 {
        lines.push(format!("토지면적: {}㎡", format_area(area)));
    }
    SourceFact::new(LAND_FACT_ID, "브이월드 토지 특성", LAND_INFO_ENDPOINT, lines.join(", "))
}

pub fn trade_fact(trade: &Trade) -> SourceFact {
    let mut lines = vec![
        format!("거래일: {}", trade.deal_date.format("%Y-%m-%d")),
        format!("거래금액: {}원", format_thousands(trade.amount_won)),
        format!("전용면적: {}㎡", format_area(trade.exclusive_area_m2)),
    ];
    if let Some(floor) = trade.floor {
        lines.push(format!("층: {floor}층"));
    }
    SourceFact::new(TRADE_FACT_ID, "아파트 실거래가(국토교통부)", TRADE_ENDPOINT, lines.join(", "))
}

pub fn price_fact(price: &PublicLandPrice) -> SourceFact {
    let mut summary = format!(
        "개별공시지가: {}원/㎡",
        format_thousands(price.price_per_m2.round() as i64)
    );
    if let Some(year) = price.base_year {
        summary.push_str(&format!(" ({year}년 기준)"));
    }
    SourceFact::new(PRICE_FACT_ID, "브이월드 개별공시지가", LAND_PRICE_ENDPOINT, summary)
}

fn news_url(item: &NewsItem) -> &str {
    item.original_link
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| item.link.trim())
}

fn news_summary(item: &NewsItem) -> String {
    let pub_date = item.pub_date.as_deref().unwrap_or("").trim();
    let description = item.description.trim();
    match (pub_date.is_empty(), description.is_empty()) {
        (false, false) => format!("{pub_date}\n{description}"),
        (false, true) => pub_date.to_string(),
        (true, false) => description.to_string(),
        (true, true) => item.title.trim().to_string(),
    }
}

/// One digest fact followed by up to `max_items` article facts, deduplicated
/// by the article's original link (else its link). Items without a url are
/// dropped.
pub fn build_news_facts(
    items: &[NewsItem],
    query: &str,
    collected_at: DateTime<Utc>,
    max_items: usize,
) -> Vec<SourceFact> {
    let max_items = max_items.clamp(1, MAX_NEWS_ITEMS);

    let mut seen = HashSet::new();
    let picked: Vec<&NewsItem> = items
        .iter()
        .filter(|item| {
            let url = news_url(item);
            !url.is_empty() && seen.insert(url.to_string())
        })
        .take(max_items)
        .collect();

    if picked.is_empty() {
        return Vec::new();
    }

    let query = query.trim();
    let mut digest = vec![
        "네이버 뉴스 검색 헤드라인 요약".to_string(),
        format!("query: {}", if query.is_empty() { "(unknown)" } else { query }),
        format!(
            "collectedAt: {}",
            collected_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
        String::new(),
        "headlines:".to_string(),
    ];
    digest.extend(
        picked
            .iter()
            .map(|item| item.title.trim())
            .filter(|t| !t.is_empty())
            .map(|t| format!("- {t}")),
    );

    let mut facts = vec![SourceFact::new(
        NEWS_DIGEST_ID,
        "네이버 뉴스 헤드라인 요약",
        NEWS_ENDPOINT,
        digest.join("\n"),
    )];

    for (idx, item) in picked.iter().enumerate() {
        let n = idx + 1;
        let title = match item.title.trim() {
            "" => format!("네이버 뉴스 {n}"),
            t => t.to_string(),
        };
        let summary = news_summary(item);
        facts.push(SourceFact {
            id: format!("{NEWS_ARTICLE_PREFIX}{n}"),
            summary: Some(if summary.is_empty() { title.clone() } else { summary }),
            title,
            url: news_url(item).to_string(),
        });
    }

    facts
}

pub fn listing_fact(complexes: &[ComplexSummary]) -> Option<SourceFact> {
    if complexes.is_empty() {
        return None;
    }

    let lines: Vec<String> = complexes
        .iter()
        .map(|c| {
            let price = match (c.deal_price_min, c.deal_price_max) {
                (Some(min), Some(max)) => format!(
                    "매매가 {}~{}만원",
                    format_thousands(min as i64),
                    format_thousands(max as i64)
                ),
                (Some(p), None) | (None, Some(p)) => {
                    format!("매매가 {}만원", format_thousands(p as i64))
                }
                (None, None) => "매매가 정보 없음".to_string(),
            };
            let count = c
                .article_count
                .map(|n| format!(", 매물 {n}건"))
                .unwrap_or_default();
            format!("- {} ({}): {price}{count}", c.complex_name, c.address)
        })
        .collect();

    Some(SourceFact::new(
        LISTING_FACT_ID,
        "네이버 부동산 요약 시세",
        LISTING_SOURCE_URL,
        lines.join("\n"),
    ))
}

/// Stands in for an empty fact list so later stages always have a source.
pub fn subject_fact(subject: &str) -> SourceFact {
    let url = reqwest::Url::parse_with_params(MAP_SEARCH_URL, &[("query", subject.trim())])
        .map(String::from)
        .unwrap_or_else(|_| MAP_SEARCH_URL.to_string());
    SourceFact::new(
        SUBJECT_FACT_ID,
        "분석 대상 입력값",
        &url,
        format!("사용자 입력 주소: {}", subject.trim()),
    )
}

/// Merges provider results into one ordered list: building, land, trade,
/// assessed price, news, listing. Ids and urls are unique afterwards (first
/// wins) and the list is never empty.
#[tracing::instrument(
    name = "pipeline_stage sources",
    skip(bundle),
    fields(pipeline.stage = "sources", sources.count, sources.placeholder)
)]
pub fn aggregate(bundle: &SourceBundle<'_>) -> Vec<SourceFact> {
    let mut candidates = Vec::new();
    candidates.extend(bundle.building.map(building_fact));
    candidates.extend(bundle.land.map(land_fact));
    candidates.extend(bundle.trade.map(trade_fact));
    candidates.extend(bundle.public_price.map(price_fact));
    candidates.extend(build_news_facts(
        bundle.news,
        bundle.news_query,
        bundle.collected_at,
        MAX_NEWS_ITEMS,
    ));
    candidates.extend(listing_fact(bundle.listings));

    let mut facts = dedupe(candidates);
    let placeholder = facts.is_empty();
    if placeholder {
        facts.push(subject_fact(bundle.subject));
    }

    let span = tracing::Span::current();
    span.record("sources.count", facts.len());
    span.record("sources.placeholder", placeholder);

    facts
}

fn dedupe(facts: Vec<SourceFact>) -> Vec<SourceFact> {
    let mut ids: HashSet<String> = HashSet::new();
    let mut urls: HashSet<String> = HashSet::new();
    facts
        .into_iter()
        .filter(|fact| {
            let url = fact.url.trim();
            if url.is_empty() || ids.contains(&fact.id) || urls.contains(url) {
                return false;
            }
            ids.insert(fact.id.clone());
            urls.insert(url.to_string());
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::land::PriceLookup;
    use chrono::{NaiveDate, TimeZone};

    fn collected_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 6, 0, 0, 0).unwrap()
    }

    fn news(title: &str, link: &str, original: Option<&str>) -> NewsItem {
        NewsItem {
            title: title.to_string(),
            link: link.to_string(),
            original_link: original.map(str::to_string),
            description: format!("{title} 설명"),
            pub_date: Some("Fri, 06 Feb 2026 09:00:00 +0900".to_string()),
        }
    }

    #[test]
    fn test_format_thousands() {
        let cases = vec![(0, "0"), (999, "999"), (1000, "1,000"), (840_000_000, "840,000,000"), (-12345, "-12,345")];
        for (value, expected) in cases {
            assert_eq!(format_thousands(value), expected);
        }
    }

    #[test]
    fn test_news_facts_dedupe_by_original_link() {
        let items = vec![
            news("첫 기사", "https://n.news.naver.com/1", Some("https://press.example.com/1")),
            news("중복 기사", "https://n.news.naver.com/2", Some("https://press.example.com/1")),
            news("링크만", "https://n.news.naver.com/3", None),
            news("주소 없음", " ", Some("")),
        ];

        let facts = build_news_facts(&items, "역삼동", collected_at(), 5);

        let ids: Vec<&str> = facts.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["naver_news_digest", "naver_news_1", "naver_news_2"]);
        assert_eq!(facts[1].url, "https://press.example.com/1");
        assert_eq!(facts[2].url, "https://n.news.naver.com/3");

        let digest = facts[0].summary.as_deref().unwrap();
        assert!(digest.contains("query: 역삼동"));
        assert!(digest.contains("collectedAt: 2026-02-06T00:00:00.000Z"));
        assert!(digest.contains("- 첫 기사\n- 링크만"));
    }

    #[test]
    fn test_news_facts_cap_and_idempotence() {
        let items: Vec<NewsItem> = (1..=8)
            .map(|n| news(&format!("기사 {n}"), &format!("https://n.news.naver.com/{n}"), None))
            .collect();

        let once = build_news_facts(&items, "q", collected_at(), 9);
        assert_eq!(once.len(), 6);
        assert_eq!(once[0].id, NEWS_DIGEST_ID);
        assert_eq!(once[5].id, "naver_news_5");

        let twice = build_news_facts(&[items.clone(), items].concat(), "q", collected_at(), 9);
        assert_eq!(once, twice);

        assert_eq!(build_news_facts(&[], "q", collected_at(), 5), Vec::<SourceFact>::new());
        assert_eq!(build_news_facts(&once_items(), "q", collected_at(), 0).len(), 2);
    }

    fn once_items() -> Vec<NewsItem> {
        vec![
            news("a", "https://n.news.naver.com/a", None),
            news("b", "https://n.news.naver.com/b", None),
        ]
    }

    #[test]
    fn test_news_article_summary_fallbacks() {
        let mut item = news("", "https://n.news.naver.com/x", None);
        item.description = String::new();
        item.pub_date = None;

        let facts = build_news_facts(&[item], "", collected_at(), 5);
        assert_eq!(facts[1].title, "네이버 뉴스 1");
        assert_eq!(facts[1].summary.as_deref(), Some("네이버 뉴스 1"));
        assert!(facts[0].summary.as_deref().unwrap().contains("query: (unknown)"));
    }

    #[test]
    fn test_aggregate_order_and_placeholder() {
        let trade = Trade {
            amount_won: 840_000_000,
            deal_date: NaiveDate::from_ymd_opt(2025, 3, 21).unwrap(),
            floor: Some(12),
            exclusive_area_m2: 84.0,
            apt_name: None,
            dong: None,
        };
        let price = PublicLandPrice {
            price_per_m2: 6_000_000.0,
            base_year: Some(2025),
            lookup: PriceLookup::Parcel,
        };
        let specs = BuildingSpecs {
            structure: Some("철근콘크리트구조".to_string()),
            representative_area_m2: Some(84.97),
            ..BuildingSpecs::default()
        };
        let items = once_items();

        let bundle = SourceBundle {
            subject: "서울 강남구 역삼동 123",
            building: Some(&specs),
            trade: Some(&trade),
            public_price: Some(&price),
            news: &items,
            news_query: "역삼동",
            collected_at: collected_at(),
            ..SourceBundle::default()
        };

        let facts = aggregate(&bundle);
        let ids: Vec<&str> = facts.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                BUILDING_FACT_ID,
                TRADE_FACT_ID,
                PRICE_FACT_ID,
                NEWS_DIGEST_ID,
                "naver_news_1",
                "naver_news_2"
            ]
        );
        assert_eq!(
            facts[0].summary.as_deref(),
            Some("전용면적: 84.97㎡, 구조: 철근콘크리트구조")
        );
        assert!(facts[1].summary.as_deref().unwrap().contains("거래금액: 840,000,000원"));
        assert_eq!(
            facts[2].summary.as_deref(),
            Some("개별공시지가: 6,000,000원/㎡ (2025년 기준)")
        );

        let empty = SourceBundle {
            subject: "  서울 강남구 역삼동 123 ",
            ..SourceBundle::default()
        };
        let facts = aggregate(&empty);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, SUBJECT_FACT_ID);
        assert!(facts[0].url.starts_with("https://map.naver.com/p/search?query="));
        assert_eq!(facts[0].summary.as_deref(), Some("사용자 입력 주소: 서울 강남구 역삼동 123"));
    }

    #[test]
    fn test_dedupe_ids_and_urls() {
        let fact = |id: &str, url: &str| SourceFact {
            id: id.to_string(),
            title: id.to_string(),
            url: url.to_string(),
            summary: None,
        };
        let facts = dedupe(vec![
            fact("a", "https://x/1"),
            fact("a", "https://x/2"),
            fact("b", "https://x/1"),
            fact("c", ""),
            fact("d", "https://x/4"),
        ]);

        let ids: Vec<&str> = facts.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[test]
    fn test_listing_fact() {
        assert!(listing_fact(&[]).is_none());

        let fact = listing_fact(&[ComplexSummary {
            complex_no: "1147".to_string(),
            complex_name: "래미안".to_string(),
            address: "역삼동".to_string(),
            deal_price_min: Some(150_000.0),
            deal_price_max: Some(210_000.0),
            article_count: Some(12),
            source_url: "https://new.land.naver.com/complexes/1147".to_string(),
        }])
        .unwrap();
        assert_eq!(fact.id, LISTING_FACT_ID);
        assert_eq!(
            fact.summary.as_deref(),
            Some("- 래미안 (역삼동): 매매가 150,000~210,000만원, 매물 12건")
        );
    }

    #[test]
    fn test_is_news_article() {
        let fact = |id: &str| SourceFact {
            id: id.to_string(),
            title: String::new(),
            url: String::new(),
            summary: None,
        };
        assert!(fact("naver_news_3").is_news_article());
        assert!(!fact("naver_news_digest").is_news_article());
        assert!(!fact("naver_news_").is_news_article());
    }
}
