use std::sync::LazyLock;

use regex::Regex;

use super::grounding::{ExpertOpinion, MarketInsight, NewsRef, Swot};
use super::sources::{NEWS_DIGEST_ID, SourceFact};
use super::valuation::ValuationResult;

const MAX_KEYWORDS: usize = 4;
const MAX_NEWS: usize = 5;
const DEFAULT_KEYWORDS: [&str; 2] = ["#부동산분석", "#가치평가"];
const REGIONS: [&str; 9] = [
    "용산", "강남", "서초", "송파", "마포", "성동", "광진", "중구", "종로",
];

static DATE_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+\d{4}\b|\b\d{4}\b").expect("valid date hint regex"));

/// What keyword rules may look at.
#[derive(Debug, Clone, Copy)]
pub struct InsightContext<'a> {
    pub subject: &'a str,
    pub digest: Option<&'a str>,
    pub current_percent: Option<f64>,
}

impl InsightContext<'_> {
    fn digest_mentions(&self, needles: &[&str]) -> bool {
        self.digest
            .is_some_and(|digest| needles.iter().any(|n| digest.contains(n)))
    }
}

pub trait KeywordRules: Send + Sync {
    fn keywords(&self, ctx: &InsightContext<'_>) -> Vec<String>;
}

struct Rule {
    keyword: &'static str,
    matches: fn(&InsightContext<'_>) -> bool,
}

fn near_station(ctx: &InsightContext<'_>) -> bool {
    ctx.subject.contains('역') || ctx.digest_mentions(&["역세권"])
}

fn school_demand(ctx: &InsightContext<'_>) -> bool {
    ctx.digest_mentions(&["학군", "학교"])
}

fn scarce_supply(ctx: &InsightContext<'_>) -> bool {
    ctx.current_percent.is_some_and(|p| p > 100.0)
}

fn undervalued(ctx: &InsightContext<'_>) -> bool {
    ctx.current_percent.is_some_and(|p| p < 90.0)
}

fn development(ctx: &InsightContext<'_>) -> bool {
    ctx.digest_mentions(&["개발", "재개발"])
}

const RULES: &[Rule] = &[
    Rule {
        keyword: "#역세권_프리미엄",
        matches: near_station,
    },
    Rule {
        keyword: "#학군수요_지속",
        matches: school_demand,
    },
    Rule {
        keyword: "#매물희소_강세",
        matches: scarce_supply,
    },
    Rule {
        keyword: "#저평가_매물",
        matches: undervalued,
    },
    Rule {
        keyword: "#개발호재",
        matches: development,
    },
];

/// Region hashtag first (only the first region found), then the rule table in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeywordRules;

impl KeywordRules for DefaultKeywordRules {
    fn keywords(&self, ctx: &InsightContext<'_>) -> Vec<String> {
        let mut keywords: Vec<String> = REGIONS
            .iter()
            .find(|region| ctx.subject.contains(*region))
            .map(|region| format!("#{region}구"))
            .into_iter()
            .collect();

        keywords.extend(
            RULES
                .iter()
                .filter(|rule| (rule.matches)(ctx))
                .map(|rule| rule.keyword.to_string()),
        );
        keywords.truncate(MAX_KEYWORDS);

        if keywords.is_empty() {
            DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect()
        } else {
            keywords
        }
    }
}

/// First summary line, when it looks like a date.
pub fn guess_published_at(summary: Option<&str>) -> Option<String> {
    let first_line = summary?.lines().next()?.trim();
    (!first_line.is_empty() && DATE_HINT_RE.is_match(first_line)).then(|| first_line.to_string())
}

pub fn news_refs(facts: &[SourceFact]) -> Vec<NewsRef> {
    facts
        .iter()
        .filter(|f| f.is_news_article())
        .take(MAX_NEWS)
        .map(|f| NewsRef {
            title: f.title.clone(),
            url: f.url.clone(),
            published_at: guess_published_at(f.summary.as_deref()),
        })
        .collect()
}

/// Gap between trade and assessed unit price, relative to the assessed one.
fn assessment_gap_percent(valuation: &ValuationResult) -> Option<f64> {
    let trade = valuation.recent_trade_unit_price.filter(|p| *p > 0)?;
    let public = valuation.public_based_unit_price.filter(|p| *p > 0)?;
    Some(((trade - public) as f64 / public as f64 * 1000.0).round() / 10.0)
}

pub fn expert_opinion(valuation: &ValuationResult) -> ExpertOpinion {
    let percent = valuation.current_percent;

    let price_background = if percent.is_some_and(|p| p > 100.0) {
        "최근 해당 지번 인근은 교통망 확충 호재가 맞물리며 ==단기간 내 실거래가가 상승==한 것으로 나타납니다. \
         전용면적 대비 거래가가 인근 평균을 상회하고 있으며, 이는 향후 기대 가치가 선반영된 결과로 풀이됩니다."
            .to_string()
    } else {
        "해당 물건은 현재 적정 시세 범위 내에서 거래되고 있습니다. \
         ==안정적인 가격 흐름==을 보이고 있어 실거주 목적의 구매에 적합한 것으로 판단됩니다."
            .to_string()
    };

    let risk_factors = match assessment_gap_percent(valuation).filter(|gap| *gap > 15.0) {
        Some(gap) => format!(
            "현재 가장 주목해야 할 점은 공시지가와 실거래가 사이의 괴리율이 {gap:.1}%에 달한다는 점입니다. \
             이는 시장이 다소 과열되어 있음을 시사하며, ==시세가 다소 높게 형성되어 있는 고평가 구간==임을 나타냅니다."
        ),
        None => "공시지가와 실거래가 간의 괴리율이 적정 범위 내에 있어, ==합리적인 가격대==로 평가됩니다. \
                 급격한 가격 조정 위험은 낮은 편입니다."
            .to_string(),
    };

    let outlook = if percent.is_some_and(|p| p > 110.0) {
        "해당 입지는 하방 경직성(가격이 잘 떨어지지 않는 성질)은 강할 것으로 보입니다. \
         다만, 현재의 높은 가격대는 수익률 측면에서 부담이 될 수 있으므로 \
         ==시세 차익을 노린 단기 투자보다는 실거주 목적의 장기적 관점==에서의 접근을 권장합니다."
            .to_string()
    } else {
        "해당 입지는 ==장기적 가치 상승 잠재력==을 보유한 것으로 분석됩니다. \
         현재 시세 수준에서 매수 시 안정적인 자산 형성이 가능할 것으로 전망됩니다."
            .to_string()
    };

    ExpertOpinion {
        price_background,
        risk_factors,
        outlook,
    }
}

pub fn swot(valuation: &ValuationResult) -> Swot {
    let strength = if valuation.current_percent.is_some_and(|p| p < 100.0) {
        "적정가 대비 저평가되어 있어 매수 적기로 판단됨"
    } else {
        "우수한 입지 조건 및 안정적인 수요 기반 확보"
    };
    let weakness = if valuation.area_m2 < 60.0 {
        "소형 평형으로 인한 제한적 주거 편의성"
    } else {
        "주변 재개발 진행 시 일시적인 정주 여건 저하 가능성"
    };

    Swot {
        strength: strength.to_string(),
        weakness: weakness.to_string(),
        opportunity: "인근 지역 개발 프로젝트 완료 시 동반 가치 상승 기대".to_string(),
        threat: "금리 변동 및 정책 변화에 따른 거래 위축 리스크".to_string(),
    }
}

pub fn market_insight(
    subject: &str,
    valuation: &ValuationResult,
    facts: &[SourceFact],
    rules: &dyn KeywordRules,
) -> MarketInsight {
    let digest = facts
        .iter()
        .find(|f| f.id == NEWS_DIGEST_ID)
        .and_then(|f| f.summary.as_deref());

    let ctx = InsightContext {
        subject,
        digest,
        current_percent: valuation.current_percent,
    };

    let news = news_refs(facts);
    let keyword_context = (!news.is_empty()).then(|| {
        let examples: Vec<String> = news.iter().take(2).map(|n| format!("\"{}\"", n.title)).collect();
        format!(
            "최근 뉴스 헤드라인을 반영해 지역 이슈를 요약했습니다. 예: {}",
            examples.join(", ")
        )
    });

    MarketInsight {
        keywords: rules.keywords(&ctx),
        keyword_context,
        news,
        expert_opinion: expert_opinion(valuation),
        swot: swot(valuation),
    }
}
