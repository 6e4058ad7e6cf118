use super::grounding::{FigureValue, KeyNumber, ReportDraft, Section, full_citations};
use super::insight::{KeywordRules, market_insight, news_refs};
use super::sources::{
    BUILDING_FACT_ID, LISTING_FACT_ID, NEWS_DIGEST_ID, PRICE_FACT_ID, SourceFact, TRADE_FACT_ID,
    format_area, format_thousands,
};
use super::synthesize::AnalysisDepth;
use super::valuation::ValuationResult;

const DEFAULT_CAUTIONS: [&str; 3] = [
    "본 보고서는 공공데이터와 웹 공개정보를 기반으로 자동 생성된 참고 자료입니다.",
    "최종 의사결정 전 반드시 전문가 검토 및 현장 확인이 필요합니다.",
    "실거래가는 거래 시점과 조건에 따라 달라질 수 있습니다.",
];

fn format_won(value: i64) -> String {
    format!("{}원", format_thousands(value))
}

fn format_eok(value: f64) -> String {
    format!("{:.1}억원", value / 100_000_000.0)
}

fn percent_reading(percent: f64) -> &'static str {
    if percent > 110.0 {
        "적정가 대비 높은 편(고평가 구간 가능성)"
    } else if percent < 90.0 {
        "적정가 대비 낮은 편(저평가 구간 가능성)"
    } else {
        "적정가 근처"
    }
}

struct FactIndex<'a> {
    facts: &'a [SourceFact],
}

impl<'a> FactIndex<'a> {
    fn get(&self, id: &str) -> Option<&'a SourceFact> {
        self.facts.iter().find(|f| f.id == id)
    }

    fn summary(&self, id: &str) -> Option<&'a str> {
        self.get(id).and_then(|f| f.summary.as_deref())
    }

    /// The subset of `ids` present in the list, in the given order.
    fn cite(&self, ids: &[&str]) -> Vec<String> {
        ids.iter()
            .filter(|id| self.get(id).is_some())
            .map(|id| id.to_string())
            .collect()
    }
}

/// A key number cites only facts present in the list. A value left without
/// any backing fact is reported as null.
fn key_number(index: &FactIndex<'_>, label: &str, value: f64, unit: &str, ids: &[&str]) -> KeyNumber {
    let citation_ids = index.cite(ids);
    KeyNumber {
        label: label.to_string(),
        value: (!citation_ids.is_empty()).then_some(FigureValue::Number(value)),
        unit: unit.to_string(),
        citation_ids,
    }
}

fn key_numbers(index: &FactIndex<'_>, valuation: &ValuationResult) -> Vec<KeyNumber> {
    let both = [TRADE_FACT_ID, PRICE_FACT_ID];
    let candidates = [
        ("전용면적", Some(valuation.area_m2), "㎡", &[BUILDING_FACT_ID, TRADE_FACT_ID][..]),
        (
            "최근 실거래 단가",
            valuation.recent_trade_unit_price.map(|v| v as f64),
            "원/㎡",
            &[TRADE_FACT_ID][..],
        ),
        (
            "공시지가 기반 단가",
            valuation.public_based_unit_price.map(|v| v as f64),
            "원/㎡",
            &[PRICE_FACT_ID][..],
        ),
        ("적정 단가", valuation.fair_unit_price.map(|v| v as f64), "원/㎡", &both[..]),
        ("현재 백분율", valuation.current_percent, "%", &both[..]),
        ("추정 가치", valuation.estimated_value.map(|v| v as f64), "원", &both[..]),
    ];

    candidates
        .into_iter()
        .filter_map(|(label, value, unit, ids)| Some(key_number(index, label, value?, unit, ids)))
        .collect()
}

fn summary(
    subject: &str,
    depth: AnalysisDepth,
    valuation: &ValuationResult,
    news_titles: &[String],
) -> String {
    let mut sentences = vec![
        format!("{subject}에 대한 부동산 가치분석 보고서입니다."),
        format!("전용면적 {}㎡ 기준으로 분석되었습니다.", format_area(valuation.area_m2)),
    ];
    if let Some(value) = valuation.estimated_value {
        sentences.push(format!(
            "추정 적정가치(총액)는 =={}== 수준입니다.",
            format_eok(value as f64)
        ));
    }
    let percent = valuation.current_percent.filter(|p| *p > 0.0);
    if let Some(percent) = percent {
        sentences.push(format!(
            "현재 시세 백분율은 {percent:.1}%로, =={}==으로 해석됩니다.",
            percent_reading(percent)
        ));
    }
    if valuation.recent_trade_unit_price.is_some() || valuation.public_based_unit_price.is_some() {
        sentences.push(
            "본 보고서는 실거래 단가와 공시지가 기반 단가를 조합한 산식으로 적정가치를 산출했습니다."
                .to_string(),
        );
    }
    if depth != AnalysisDepth::Basic
        && let Some(title) = news_titles.first()
    {
        sentences.push(format!("최근 뉴스 기반 참고 이슈를 함께 반영했습니다(예: {title})."));
    }
    sentences.push(
        "본 결과는 공개 데이터 기반 참고용이며, 중요한 의사결정 전에는 추가 조사와 전문가 확인을 권장합니다."
            .to_string(),
    );

    let mut bullets = Vec::new();
    if let Some(value) = valuation.estimated_value {
        bullets.push(format!("• 추정 적정가치: =={}==", format_eok(value as f64)));
    }
    if let Some(fair) = valuation.fair_unit_price {
        bullets.push(format!("• 적정 단가: {}/㎡", format_won(fair)));
    }
    if let Some(percent) = percent {
        bullets.push(format!("• 현재 시세 백분율: {percent:.1}%"));
    }
    if !news_titles.is_empty() {
        let titles: Vec<&str> = news_titles.iter().take(2).map(String::as_str).collect();
        bullets.push(format!("• 최근 뉴스(근거): {}", titles.join(" / ")));
    }
    bullets.truncate(depth.bullet_limit());

    let mut blocks = vec![sentences.join(" ")];
    if !bullets.is_empty() {
        blocks.push(String::new());
        blocks.push("핵심 포인트:".to_string());
        blocks.extend(bullets);
    }
    blocks.join("\n").trim().to_string()
}

fn sections(
    subject: &str,
    index: &FactIndex<'_>,
    valuation: &ValuationResult,
    news_titles: &[String],
    cautions: &[String],
) -> Vec<Section> {
    let overview = match index.summary(BUILDING_FACT_ID) {
        Some(summary) => summary.to_string(),
        None => format!(
            "분석 대상: {subject}\n전용면적: {}㎡",
            format_area(valuation.area_m2)
        ),
    };

    let mut trade = Vec::new();
    if let Some(summary) = index.summary(TRADE_FACT_ID) {
        trade.push(summary.to_string());
    }
    if let Some(unit) = valuation.recent_trade_unit_price {
        trade.push(format!("• 최근 실거래 단가: {}/㎡", format_won(unit)));
        trade.push(format!(
            "• 전용면적 기준 거래가: {}",
            format_eok(unit as f64 * valuation.area_m2)
        ));
    }
    let trade = if trade.is_empty() {
        "최근 실거래 정보를 확인할 수 없습니다. 인근 유사 물건의 거래 사례를 참고하시기 바랍니다.".to_string()
    } else {
        trade.join("\n")
    };

    let mut assessed = Vec::new();
    if let Some(summary) = index.summary(PRICE_FACT_ID) {
        assessed.push(summary.to_string());
    }
    if let Some(public) = valuation.public_based_unit_price {
        assessed.push(format!("• 공시지가 기반 추정 단가: {}/㎡", format_won(public)));
        if let Some(trade) = valuation.recent_trade_unit_price.filter(|t| *t > 0) {
            assessed.push(format!(
                "• 실거래가 대비 공시지가 비율: {:.1}%",
                public as f64 / trade as f64 * 100.0
            ));
        }
    }
    let assessed = if assessed.is_empty() {
        "개별공시지가 정보를 확인할 수 없습니다.".to_string()
    } else {
        assessed.join("\n")
    };

    let mut derivation = vec!["적정 단가는 다음 산식으로 계산되었습니다:".to_string()];
    derivation.extend(valuation.formula_description.lines().map(|line| format!("• {line}")));
    if let Some(fair) = valuation.fair_unit_price {
        derivation.push(format!("• 산출된 적정 단가: {}/㎡", format_won(fair)));
    }
    if let Some(value) = valuation.estimated_value {
        derivation.push(format!("• 추정 적정가치: {}", format_eok(value as f64)));
    }

    let mut market = Vec::new();
    if let Some(digest) = index.summary(NEWS_DIGEST_ID) {
        market.push(digest.to_string());
    }
    if !news_titles.is_empty() {
        market.push("\n관련 정보:".to_string());
        market.extend(news_titles.iter().take(3).map(|title| format!("• {title}")));
    }
    if let Some(listing) = index.summary(LISTING_FACT_ID) {
        market.push(listing.to_string());
    }
    let market = if market.is_empty() {
        "시장 동향 정보를 확인할 수 없습니다. 추가 조사가 필요합니다.".to_string()
    } else {
        market.join("\n")
    };

    let caution_lines: Vec<String> = cautions.iter().map(|c| format!("• {c}")).collect();

    [
        ("물건 개요", overview),
        ("실거래가 분석", trade),
        ("공시지가 분석", assessed),
        ("적정가치 산출", derivation.join("\n")),
        ("시장 동향 및 참고 정보", market),
        ("주의사항", caution_lines.join("\n")),
    ]
    .into_iter()
    .map(|(title, content)| Section {
        title: title.to_string(),
        content,
    })
    .collect()
}

/// Template report built only from the valuation and the facts. It is
/// valid for every valuation, including one where every value is null.
pub fn build_fallback_report(
    subject: &str,
    depth: AnalysisDepth,
    valuation: &ValuationResult,
    facts: &[SourceFact],
    rules: &dyn KeywordRules,
) -> ReportDraft {
    let index = FactIndex { facts };
    let news_titles: Vec<String> = news_refs(facts).into_iter().map(|n| n.title).collect();

    let cautions: Vec<String> = if valuation.cautions.is_empty() {
        DEFAULT_CAUTIONS.iter().map(|c| c.to_string()).collect()
    } else {
        valuation.cautions.clone()
    };

    ReportDraft {
        summary: summary(subject, depth, valuation, &news_titles),
        sections: sections(subject, &index, valuation, &news_titles, &cautions),
        key_numbers: key_numbers(&index, valuation),
        cautions,
        citations: full_citations(facts),
        market_insight: Some(market_insight(subject, valuation, facts, rules)),
    }
}
