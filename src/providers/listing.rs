use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::land::Coordinates;
use super::{FetchPolicy, Providers, UpstreamError, as_f64, as_text, build_url};

pub const LISTING_SOURCE_URL: &str = "https://m.land.naver.com/";
const CLUSTER_ENDPOINT: &str = "https://m.land.naver.com/cluster/clusterList";
const COMPLEX_ENDPOINT: &str = "https://m.land.naver.com/cluster/ajax/complexList";

const PROVIDER: &str = "naver_land";
const MAX_CLUSTERS: usize = 3;
const MAX_COMPLEXES_PER_CLUSTER: usize = 8;
const CLUSTER_PAUSE: Duration = Duration::from_secs(1);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexSummary {
    pub complex_no: String,
    pub complex_name: String,
    pub address: String,
    pub deal_price_min: Option<f64>,
    pub deal_price_max: Option<f64>,
    pub article_count: Option<u32>,
    pub source_url: String,
}

/// Cluster ids of the first clusters around the point.
pub fn parse_clusters(json: &Value) -> Vec<String> {
    json.pointer("/result/list")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .take(MAX_CLUSTERS)
                .filter_map(|cluster| as_text(cluster.get("lgeo")))
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_complexes(json: &Value, fallback_address: &str) -> Vec<ComplexSummary> {
    let Some(list) = json.pointer("/result/list").and_then(Value::as_array) else {
        return Vec::new();
    };

    list.iter()
        .take(MAX_COMPLEXES_PER_CLUSTER)
        .filter_map(|item| {
            let complex_no = as_text(item.get("hscpNo"))?;
            Some(ComplexSummary {
                complex_name: as_text(item.get("hscpNm")).unwrap_or_else(|| "Unknown".to_string()),
                address: as_text(item.get("cortarAddress"))
                    .unwrap_or_else(|| fallback_address.trim().to_string()),
                deal_price_min: as_f64(item.get("dealPrcMin")),
                deal_price_max: as_f64(item.get("dealPrcMax")),
                article_count: as_f64(item.get("atclCnt"))
                    .or_else(|| as_f64(item.get("rletCnt")))
                    .filter(|c| *c >= 0.0)
                    .map(|c| c as u32),
                source_url: format!("https://new.land.naver.com/complexes/{complex_no}"),
                complex_no,
            })
        })
        .collect()
}

/// Complex summaries around the coordinates. Without coordinates there is
/// nothing to crawl and the result is empty.
#[tracing::instrument(
    name = "provider listing",
    skip(providers, address),
    fields(listing.clusters, listing.complexes)
)]
pub async fn crawl_listings(
    providers: &Providers,
    address: &str,
    coords: Option<Coordinates>,
    cortar_no: Option<&str>,
) -> Result<Vec<ComplexSummary>, UpstreamError> {
    let Some(coords) = coords else {
        return Ok(Vec::new());
    };

    let headers = [("User-Agent", USER_AGENT), ("Referer", LISTING_SOURCE_URL)];
    let policy = FetchPolicy {
        timeout: Duration::from_secs(10),
        retries: 1,
        backoff: Duration::from_secs(1),
    };

    let lat = coords.lat.to_string();
    let lng = coords.lng.to_string();
    let btm = (coords.lat - 0.01).to_string();
    let top = (coords.lat + 0.01).to_string();
    let lft = (coords.lng - 0.01).to_string();
    let rgt = (coords.lng + 0.01).to_string();

    let cluster_url = build_url(
        PROVIDER,
        CLUSTER_ENDPOINT,
        &[
            ("view", "atcl"),
            ("rletTpCd", "APT"),
            ("tradTpCd", "A1"),
            ("z", "15"),
            ("lat", &lat),
            ("lon", &lng),
            ("cortarNo", cortar_no.unwrap_or("")),
            ("btm", &btm),
            ("lft", &lft),
            ("top", &top),
            ("rgt", &rgt),
        ],
    )?;
    let clusters = parse_clusters(
        &providers
            .client
            .fetch_json(PROVIDER, cluster_url, &headers, policy)
            .await?,
    );

    let mut seen = HashSet::new();
    let mut complexes = Vec::new();

    for (i, lgeo) in clusters.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(CLUSTER_PAUSE).await;
        }

        let url = build_url(
            PROVIDER,
            COMPLEX_ENDPOINT,
            &[
                ("itemId", lgeo.as_str()),
                ("mapKey", ""),
                ("lgeo", lgeo.as_str()),
                ("rletTpCd", "APT"),
                ("tradTpCd", "A1"),
                ("z", "15"),
                ("lat", &lat),
                ("lon", &lng),
            ],
        )?;

        let json = match providers.client.fetch_json(PROVIDER, url, &headers, policy).await {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(cluster = %lgeo, error = %err, "Complex list unavailable");
                continue;
            }
        };

        for complex in parse_complexes(&json, address) {
            if seen.insert(complex.complex_no.clone()) {
                complexes.push(complex);
            }
        }
    }

    let span = tracing::Span::current();
    span.record("listing.clusters", clusters.len());
    span.record("listing.complexes", complexes.len());

    Ok(complexes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_clusters_keeps_first_three() {
        let payload = json!({"result": {"list": [
            {"lgeo": "2120"}, {"lgeo": "2121"}, {"count": 3}, {"lgeo": "2123"}
        ]}});

        assert_eq!(parse_clusters(&payload), vec!["2120", "2121"]);
        assert!(parse_clusters(&json!({"result": null})).is_empty());
    }

    #[test]
    fn test_parse_complexes() {
        let payload = json!({"result": {"list": [
            {"hscpNo": "1147", "hscpNm": "래미안", "cortarAddress": "서울시 강남구 역삼동", "dealPrcMin": "150000", "dealPrcMax": 210000, "atclCnt": 12},
            {"hscpNo": "", "hscpNm": "skip"},
            {"hscpNo": 2235, "rletCnt": "4"}
        ]}});

        let complexes = parse_complexes(&payload, "역삼동 123");
        assert_eq!(complexes.len(), 2);

        assert_eq!(complexes[0].complex_name, "래미안");
        assert_eq!(complexes[0].deal_price_min, Some(150_000.0));
        assert_eq!(complexes[0].article_count, Some(12));
        assert_eq!(complexes[0].source_url, "https://new.land.naver.com/complexes/1147");

        assert_eq!(complexes[1].complex_no, "2235");
        assert_eq!(complexes[1].complex_name, "Unknown");
        assert_eq!(complexes[1].address, "역삼동 123");
        assert_eq!(complexes[1].article_count, Some(4));
    }

    #[test]
    fn test_parse_complexes_caps_per_cluster() {
        let list: Vec<Value> = (0..12).map(|n| json!({"hscpNo": n.to_string()})).collect();
        let payload = json!({"result": {"list": list}});
        assert_eq!(parse_complexes(&payload, "x").len(), 8);
    }

    #[tokio::test]
    async fn test_crawl_without_coordinates_is_empty() {
        let providers = Providers::from_config(&crate::config::Config::for_tests());
        let complexes = crawl_listings(&providers, "역삼동 123", None, None).await.unwrap();
        assert!(complexes.is_empty());
    }
}
