use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Providers, UpstreamError, as_f64, as_text, build_url, item_list};

pub const LAND_INFO_ENDPOINT: &str = "https://api.vworld.kr/ned/data/ladfrlList";
pub const LAND_PRICE_ENDPOINT: &str = "https://api.vworld.kr/ned/data/getIndvdLandPriceAttr";
const SPATIAL_ENDPOINT: &str = "https://api.vworld.kr/req/data";
const GEOCODE_ENDPOINT: &str = "https://api.vworld.kr/req/address";

const PROVIDER: &str = "vworld";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        match (lat, lng) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() && lat != 0.0 => {
                Some(Self { lat, lng })
            }
            _ => None,
        }
    }

    fn point(&self) -> String {
        format!("POINT({} {})", self.lng, self.lat)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LandInfo {
    pub land_category: Option<String>,
    pub parcel_area_m2: Option<f64>,
}

impl LandInfo {
    fn is_empty(&self) -> bool {
        self.land_category.is_none() && self.parcel_area_m2.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceLookup {
    Parcel,
    Spatial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicLandPrice {
    pub price_per_m2: f64,
    pub base_year: Option<i32>,
    pub lookup: PriceLookup,
}

/// Parcel numbers shorter than the region prefix cannot address a lot.
pub fn usable_pnu(pnu: Option<&str>) -> Option<&str> {
    pnu.map(str::trim).filter(|p| p.len() >= 8)
}

fn spatial_properties(json: &Value) -> Option<&Value> {
    json.pointer("/response/result/featureCollection/features/0/properties")
}

pub fn parse_land_info(json: &Value) -> Option<LandInfo> {
    let item = json.pointer("/ladfrlVOList/ladfrlVOList/0")?;
    let info = LandInfo {
        land_category: as_text(item.get("lndcgrCodeNm")),
        parcel_area_m2: as_f64(item.get("lndpclAr")).filter(|a| *a > 0.0),
    };
    (!info.is_empty()).then_some(info)
}

pub fn parse_spatial_land_info(json: &Value) -> Option<LandInfo> {
    let props = spatial_properties(json)?;
    let info = LandInfo {
        land_category: as_text(props.get("jimok")).or_else(|| as_text(props.get("lndcgr_nm"))),
        parcel_area_m2: as_f64(props.get("pclnd_area"))
            .or_else(|| as_f64(props.get("area")))
            .filter(|a| *a > 0.0),
    };
    (!info.is_empty()).then_some(info)
}

/// The attribute service answers either `indvdLandPrices.field` or
/// `response.body.items.item`, each as a list or a single object.
pub fn parse_price_attr(json: &Value) -> Option<PublicLandPrice> {
    let item = if let Some(root) = json.get("indvdLandPrices") {
        item_list(root.get("field"))
            .first()
            .copied()
            .or_else(|| item_list(root.get("item")).first().copied())
            .unwrap_or(root)
    } else {
        *item_list(json.pointer("/response/body/items/item")).first()?
    };

    let price = as_f64(item.get("pblntfPclnd")).filter(|p| *p > 0.0)?;
    Some(PublicLandPrice {
        price_per_m2: price,
        base_year: as_f64(item.get("stdrYear")).map(|y| y as i32),
        lookup: PriceLookup::Parcel,
    })
}

pub fn parse_spatial_price(json: &Value) -> Option<PublicLandPrice> {
    let props = spatial_properties(json)?;
    let price = as_f64(props.get("pblntf_pclnd"))
        .or_else(|| as_f64(props.get("jiga")))
        .filter(|p| *p > 0.0)?;
    Some(PublicLandPrice {
        price_per_m2: price,
        base_year: as_f64(props.get("stdr_year")).map(|y| y as i32),
        lookup: PriceLookup::Spatial,
    })
}

pub fn parse_geocode(json: &Value) -> Option<Coordinates> {
    let point = json.pointer("/response/result/point")?;
    Coordinates::new(as_f64(point.get("y")), as_f64(point.get("x")))
}

#[tracing::instrument(name = "provider geocode", skip(providers, key, address))]
pub async fn geocode(
    providers: &Providers,
    key: &str,
    address: &str,
) -> Result<Option<Coordinates>, UpstreamError> {
    let url = build_url(
        PROVIDER,
        GEOCODE_ENDPOINT,
        &[
            ("service", "address"),
            ("request", "getcoord"),
            ("key", key),
            ("type", "ROAD"),
            ("address", address),
        ],
    )?;
    let json = providers
        .client
        .fetch_json(PROVIDER, url, &[], providers.single_attempt())
        .await?;
    Ok(parse_geocode(&json))
}

/// Land characteristics by parcel number, falling back to the cadastral
/// layer at the given coordinates.
#[tracing::instrument(name = "provider land_info", skip(providers, key), fields(land.found))]
pub async fn fetch_land_info(
    providers: &Providers,
    key: &str,
    pnu: Option<&str>,
    coords: Option<Coordinates>,
) -> Result<Option<LandInfo>, UpstreamError> {
    let mut last_err = None;

    if let Some(pnu) = usable_pnu(pnu) {
        let url = build_url(
            PROVIDER,
            LAND_INFO_ENDPOINT,
            &[
                ("key", key),
                ("pnu", pnu),
                ("format", "json"),
                ("numOfRows", "1"),
                ("domain", "localhost"),
            ],
        )?;
        match providers
            .client
            .fetch_json(PROVIDER, url, &[], providers.single_attempt())
            .await
        {
            Ok(json) => {
                if let Some(info) = parse_land_info(&json) {
                    tracing::Span::current().record("land.found", true);
                    return Ok(Some(info));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Parcel land lookup failed");
                last_err = Some(err);
            }
        }
    }

    if let Some(coords) = coords {
        let point = coords.point();
        let url = build_url(
            PROVIDER,
            SPATIAL_ENDPOINT,
            &[
                ("service", "data"),
                ("request", "GetFeature"),
                ("data", "LP_PA_CBND_BUBUN"),
                ("key", key),
                ("size", "1"),
                ("geomFilter", &point),
                ("domain", "localhost"),
            ],
        )?;
        let json = providers
            .client
            .fetch_json(PROVIDER, url, &[], providers.single_attempt())
            .await?;
        let info = parse_spatial_land_info(&json);
        tracing::Span::current().record("land.found", info.is_some());
        return Ok(info);
    }

    match last_err {
        Some(err) => Err(err),
        None => Ok(None),
    }
}

/// Individual assessed land price by parcel number, falling back to the
/// assessed-price layer at the given coordinates.
#[tracing::instrument(
    name = "provider public_price",
    skip(providers, key),
    fields(price.lookup)
)]
pub async fn fetch_public_price(
    providers: &Providers,
    key: &str,
    pnu: Option<&str>,
    coords: Option<Coordinates>,
) -> Result<Option<PublicLandPrice>, UpstreamError> {
    let mut last_err = None;

    if let Some(pnu) = usable_pnu(pnu) {
        let url = build_url(
            PROVIDER,
            LAND_PRICE_ENDPOINT,
            &[
                ("key", key),
                ("pnu", pnu),
                ("format", "json"),
                ("numOfRows", "1"),
                ("pageNo", "1"),
                ("domain", "localhost"),
            ],
        )?;
        match providers
            .client
            .fetch_json(PROVIDER, url, &[], providers.single_attempt())
            .await
        {
            Ok(json) => match parse_price_attr(&json) {
                Some(price) => {
                    tracing::Span::current().record("price.lookup", "parcel");
                    return Ok(Some(price));
                }
                None => tracing::info!("Parcel price lookup returned no positive price"),
            },
            Err(err) => {
                tracing::warn!(error = %err, "Parcel price lookup failed");
                last_err = Some(err);
            }
        }
    }

    if let Some(coords) = coords {
        let point = coords.point();
        let url = build_url(
            PROVIDER,
            SPATIAL_ENDPOINT,
            &[
                ("service", "data"),
                ("request", "GetFeature"),
                ("data", "LP_PA_CBND_INDVDPBLNTF"),
                ("key", key),
                ("size", "1"),
                ("geomFilter", &point),
                ("domain", "localhost"),
            ],
        )?;
        let json = providers
            .client
            .fetch_json(PROVIDER, url, &[], providers.single_attempt())
            .await?;
        let price = parse_spatial_price(&json);
        if price.is_some() {
            tracing::Span::current().record("price.lookup", "spatial");
        }
        return Ok(price);
    }

    match last_err {
        Some(err) => Err(err),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_land_info() {
        let payload = json!({
            "ladfrlVOList": {"ladfrlVOList": [
                {"lndcgrCodeNm": "대", "lndpclAr": "1520.3"}
            ]}
        });

        let info = parse_land_info(&payload).unwrap();
        assert_eq!(info.land_category.as_deref(), Some("대"));
        assert_eq!(info.parcel_area_m2, Some(1520.3));

        let empty = json!({"ladfrlVOList": {"ladfrlVOList": [{"lndcgrCodeNm": " "}]}});
        assert!(parse_land_info(&empty).is_none());
    }

    #[test]
    fn test_parse_spatial_land_info() {
        let payload = json!({"response": {"result": {"featureCollection": {"features": [
            {"properties": {"lndcgr_nm": "전", "area": 300}}
        ]}}}});

        let info = parse_spatial_land_info(&payload).unwrap();
        assert_eq!(info.land_category.as_deref(), Some("전"));
        assert_eq!(info.parcel_area_m2, Some(300.0));
    }

    #[test]
    fn test_parse_price_attr_shapes() {
        let cases = vec![
            (
                json!({"indvdLandPrices": {"field": [{"pblntfPclnd": "6000000", "stdrYear": "2025"}]}}),
                Some((6_000_000.0, Some(2025))),
            ),
            (
                json!({"indvdLandPrices": {"field": {"pblntfPclnd": 5100000, "stdrYear": 2024}}}),
                Some((5_100_000.0, Some(2024))),
            ),
            (
                json!({"response": {"body": {"items": {"item": [{"pblntfPclnd": "7000000"}]}}}}),
                Some((7_000_000.0, None)),
            ),
            (
                json!({"indvdLandPrices": {"pblntfPclnd": "4200000", "stdrYear": "2023"}}),
                Some((4_200_000.0, Some(2023))),
            ),
            (json!({"indvdLandPrices": {"field": [{"pblntfPclnd": "0"}]}}), None),
            (json!({"unexpected": true}), None),
        ];

        for (payload, expected) in cases {
            let parsed = parse_price_attr(&payload).map(|p| (p.price_per_m2, p.base_year));
            assert_eq!(parsed, expected, "payload {payload}");
        }
    }

    #[test]
    fn test_parse_spatial_price_uses_jiga() {
        let payload = json!({"response": {"result": {"featureCollection": {"features": [
            {"properties": {"jiga": "3500000", "stdr_year": "2025"}}
        ]}}}});

        let price = parse_spatial_price(&payload).unwrap();
        assert_eq!(price.price_per_m2, 3_500_000.0);
        assert_eq!(price.base_year, Some(2025));
        assert_eq!(price.lookup, PriceLookup::Spatial);
    }

    #[test]
    fn test_parse_geocode() {
        let payload = json!({"response": {"result": {"point": {"x": "127.0276", "y": "37.4979"}}}});
        let coords = parse_geocode(&payload).unwrap();
        assert_eq!(coords.lat, 37.4979);
        assert_eq!(coords.lng, 127.0276);

        assert!(parse_geocode(&json!({"response": {"status": "NOT_FOUND"}})).is_none());
    }

    #[test]
    fn test_usable_pnu() {
        assert_eq!(usable_pnu(Some("1168010300100010000")), Some("1168010300100010000"));
        assert_eq!(usable_pnu(Some("1168")), None);
        assert_eq!(usable_pnu(None), None);
    }

    #[test]
    fn test_coordinates_require_both_axes() {
        assert!(Coordinates::new(Some(37.5), Some(127.0)).is_some());
        assert!(Coordinates::new(Some(37.5), None).is_none());
        assert!(Coordinates::new(Some(f64::NAN), Some(127.0)).is_none());
        assert!(Coordinates::new(Some(0.0), Some(0.0)).is_none());
    }
}
