use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Providers, UpstreamError, build_url};

pub const NEWS_ENDPOINT: &str = "https://openapi.naver.com/v1/search/news.json";

const PROVIDER: &str = "naver_news";
const MAX_DISPLAY: u32 = 10;

static BOLD_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?b>").expect("valid tag regex"));
static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<script|</script|javascript:").expect("valid script regex"));

#[derive(Clone)]
pub struct NaverCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub title: String,
    pub link: String,
    pub original_link: Option<String>,
    pub description: String,
    pub pub_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<RawNewsItem>,
}

#[derive(Debug, Deserialize)]
struct RawNewsItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default, rename = "originallink")]
    original_link: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "pubDate")]
    pub_date: Option<String>,
}

impl From<RawNewsItem> for NewsItem {
    fn from(raw: RawNewsItem) -> Self {
        let original_link = raw.original_link.trim();
        Self {
            title: clean_markup(&raw.title),
            link: raw.link.trim().to_string(),
            original_link: (!original_link.is_empty()).then(|| original_link.to_string()),
            description: clean_markup(&raw.description),
            pub_date: raw.pub_date.filter(|d| !d.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSort {
    #[default]
    Sim,
    Date,
}

impl SearchSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchSort::Sim => "sim",
            SearchSort::Date => "date",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("검색어에 허용되지 않는 패턴이 포함되어 있습니다.")]
    ForbiddenPattern,

    #[error("검색어는 2자 이상 80자 이하로 입력해주세요.")]
    Length,
}

/// Trims and collapses whitespace, then rejects control characters,
/// script markers and queries outside 2..=80 characters.
pub fn sanitize_query(raw: &str) -> Result<String, QueryError> {
    let value = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    if value.chars().any(|c| c.is_control()) || SCRIPT_RE.is_match(&value) {
        return Err(QueryError::ForbiddenPattern);
    }

    let len = value.chars().count();
    if !(2..=80).contains(&len) {
        return Err(QueryError::Length);
    }

    Ok(value)
}

pub fn clamp_display(display: Option<i64>) -> u32 {
    display.unwrap_or(i64::from(MAX_DISPLAY)).clamp(1, i64::from(MAX_DISPLAY)) as u32
}

/// Strips the highlight tags the search API injects and decodes common entities.
pub fn clean_markup(text: &str) -> String {
    BOLD_TAG_RE
        .replace_all(text, "")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

#[tracing::instrument(
    name = "provider news",
    skip(providers, credentials, query),
    fields(news.display = display_count, news.sort = sort.as_str(), news.count)
)]
pub async fn search_news(
    providers: &Providers,
    credentials: &NaverCredentials,
    query: &str,
    display_count: u32,
    sort: SearchSort,
) -> Result<Vec<NewsItem>, UpstreamError> {
    let display = display_count.clamp(1, MAX_DISPLAY).to_string();
    let url = build_url(
        PROVIDER,
        NEWS_ENDPOINT,
        &[("query", query), ("display", &display), ("sort", sort.as_str())],
    )?;

    let body = providers
        .client
        .fetch_text(
            PROVIDER,
            url,
            &[
                ("X-Naver-Client-Id", credentials.client_id.as_str()),
                ("X-Naver-Client-Secret", credentials.client_secret.as_str()),
            ],
            providers.single_attempt(),
        )
        .await?;

    let items = parse_search_response(&body)?;
    tracing::Span::current().record("news.count", items.len());
    Ok(items)
}

fn parse_search_response(body: &str) -> Result<Vec<NewsItem>, UpstreamError> {
    let response: SearchResponse =
        serde_json::from_str(body).map_err(|e| UpstreamError::Payload {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
    Ok(response.items.into_iter().map(NewsItem::from).collect())
}
