//! Extracts a product name and price from a fetched page body.
//!
//! Three formats are tried in order: a JSON body `{"name", "price"}`,
//! schema.org `Product` JSON-LD embedded in HTML, then Open Graph style
//! `og:title` / `product:price:amount` meta tags.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::FetchError;
use crate::FetchedPrice;

static JSONLD_SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script[^>]+type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#)
        .expect("valid regex")
});

static META_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid regex"));

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

/// Parses `body` fetched from `url`.
///
/// # Errors
///
/// - [`FetchError::Deserialize`] if the body looks like JSON but does not parse.
/// - [`FetchError::MissingProductData`] if no format yields both a name and a price.
/// - [`FetchError::InvalidPrice`] if a price was found but is not a non-negative decimal.
pub fn parse_product_page(body: &str, url: &str) -> Result<FetchedPrice, FetchError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        let value: Value =
            serde_json::from_str(trimmed).map_err(|source| FetchError::Deserialize {
                context: format!("product body from {url}"),
                source,
            })?;
        return product_from_json(&value, url)?.ok_or_else(|| missing(url));
    }

    if let Some(found) = extract_jsonld_product(body, url)? {
        return Ok(found);
    }
    extract_meta_product(body, url)?.ok_or_else(|| missing(url))
}

fn missing(url: &str) -> FetchError {
    FetchError::MissingProductData {
        url: url.to_owned(),
    }
}

/// `{"name": ..., "price": ...}` at the top level.
fn product_from_json(value: &Value, url: &str) -> Result<Option<FetchedPrice>, FetchError> {
    let Some(name) = value.get("name").and_then(Value::as_str).map(str::trim) else {
        return Ok(None);
    };
    let Some(price) = value.get("price") else {
        return Ok(None);
    };
    if name.is_empty() {
        return Ok(None);
    }
    Ok(Some(FetchedPrice {
        name: decode_entities(name),
        price: price_from_value(price, url)?,
    }))
}

fn extract_jsonld_product(html: &str, url: &str) -> Result<Option<FetchedPrice>, FetchError> {
    for cap in JSONLD_SCRIPT_RE.captures_iter(html) {
        let Some(json_text) = cap.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(json_text) else {
            continue;
        };

        // Accept top-level object, array, or @graph container.
        let mut candidates: Vec<&Value> = match &value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let graphs: Vec<&Value> = candidates
            .iter()
            .copied()
            .filter_map(|item| item.get("@graph").and_then(Value::as_array))
            .flatten()
            .collect();
        candidates.extend(graphs);

        for item in candidates {
            if !is_product_type(item) {
                continue;
            }
            if let Some(found) = jsonld_item_to_product(item, url)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

/// `@type` may be a plain string or an array of strings.
fn is_product_type(item: &Value) -> bool {
    match item.get("@type") {
        Some(Value::String(s)) => s.eq_ignore_ascii_case("Product"),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|s| s.eq_ignore_ascii_case("Product")),
        _ => false,
    }
}

fn jsonld_item_to_product(item: &Value, url: &str) -> Result<Option<FetchedPrice>, FetchError> {
    let Some(name) = item.get("name").and_then(Value::as_str).map(str::trim) else {
        return Ok(None);
    };
    if name.is_empty() {
        return Ok(None);
    }

    let offers: Vec<&Value> = match item.get("offers") {
        Some(Value::Array(list)) => list.iter().collect(),
        Some(offer @ Value::Object(_)) => vec![offer],
        _ => Vec::new(),
    };

    // AggregateOffer carries lowPrice instead of price.
    let raw_price = offers
        .iter()
        .find_map(|offer| offer.get("price").or_else(|| offer.get("lowPrice")));

    match raw_price {
        Some(price) => Ok(Some(FetchedPrice {
            name: decode_entities(name),
            price: price_from_value(price, url)?,
        })),
        None => Ok(None),
    }
}

fn extract_meta_product(html: &str, url: &str) -> Result<Option<FetchedPrice>, FetchError> {
    let mut title = None;
    let mut amount = None;

    for tag in META_TAG_RE.find_iter(html) {
        let mut key = None;
        let mut content = None;
        for attr in ATTR_RE.captures_iter(tag.as_str()) {
            let value = attr.get(2).or_else(|| attr.get(3)).map(|m| m.as_str());
            match attr.get(1).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
                Some("property" | "name" | "itemprop") => key = value,
                Some("content") => content = value,
                _ => {}
            }
        }
        let (Some(key), Some(content)) = (key, content) else {
            continue;
        };
        match key {
            "og:title" if title.is_none() => title = Some(content.trim()),
            "product:price:amount" | "og:price:amount" | "price" if amount.is_none() => {
                amount = Some(content);
            }
            _ => {}
        }
    }

    match (title, amount) {
        (Some(name), Some(raw)) if !name.is_empty() => Ok(Some(FetchedPrice {
            name: decode_entities(name),
            price: parse_price(raw, url)?,
        })),
        _ => Ok(None),
    }
}

fn price_from_value(value: &Value, url: &str) -> Result<Decimal, FetchError> {
    match value {
        Value::String(s) => parse_price(s, url),
        Value::Number(n) => parse_price(&n.to_string(), url),
        other => Err(FetchError::InvalidPrice {
            url: url.to_owned(),
            raw: other.to_string(),
        }),
    }
}

/// Parses a price such as `"12.99"`, `"$1,299.00"`, `"45 USD"` or `"1e2"`.
///
/// # Errors
///
/// Returns [`FetchError::InvalidPrice`] for anything that is not a
/// non-negative decimal after stripping a currency symbol and thousands
/// separators.
pub fn parse_price(raw: &str, url: &str) -> Result<Decimal, FetchError> {
    let invalid = || FetchError::InvalidPrice {
        url: url.to_owned(),
        raw: raw.to_owned(),
    };

    let cleaned: String = raw
        .trim()
        .trim_start_matches(|c: char| !(c.is_ascii_digit() || c == '-' || c == '.'))
        .trim_end_matches(|c: char| c.is_alphabetic() || c.is_whitespace())
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();

    let price = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|_| invalid())?;

    if price.is_sign_negative() && !price.is_zero() {
        return Err(invalid());
    }
    Ok(price.normalize())
}

fn decode_entities(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://shop.example.com/p/widget";

    #[test]
    fn json_body_with_string_price() {
        let got = parse_product_page(r#"{"name": "Widget", "price": "12.99"}"#, URL).unwrap();
        assert_eq!(got.name, "Widget");
        assert_eq!(got.price, Decimal::new(1299, 2));
    }

    #[test]
    fn json_body_with_numeric_price() {
        let got = parse_product_page(r#"{"name": "Widget", "price": 8.5}"#, URL).unwrap();
        assert_eq!(got.price, Decimal::new(85, 1));
    }

    #[test]
    fn json_body_without_price_is_missing_data() {
        let err = parse_product_page(r#"{"name": "Widget"}"#, URL).unwrap_err();
        assert!(matches!(err, FetchError::MissingProductData { .. }));
    }

    #[test]
    fn malformed_json_body_is_deserialize_error() {
        let err = parse_product_page(r#"{"name": "Widget","#, URL).unwrap_err();
        assert!(matches!(err, FetchError::Deserialize { .. }));
    }

    #[test]
    fn jsonld_product_with_offer_object() {
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@context":"https://schema.org","@type":"Product","name":"Trail Shoe",
             "offers":{"@type":"Offer","price":"89.90","priceCurrency":"USD"}}
            </script></head></html>"#;
        let got = parse_product_page(html, URL).unwrap();
        assert_eq!(got.name, "Trail Shoe");
        assert_eq!(got.price, Decimal::new(8990, 2).normalize());
    }

    #[test]
    fn jsonld_product_inside_graph_with_offer_array() {
        let html = r#"<script type='application/ld+json'>
            {"@graph":[{"@type":"WebPage","name":"Page"},
                       {"@type":["Product"],"name":"Kettle &amp; Lid",
                        "offers":[{"price":45},{"price":50}]}]}
            </script>"#;
        let got = parse_product_page(html, URL).unwrap();
        assert_eq!(got.name, "Kettle & Lid");
        assert_eq!(got.price, Decimal::new(45, 0));
    }

    #[test]
    fn jsonld_aggregate_offer_uses_low_price() {
        let html = r#"<script type="application/ld+json">
            {"@type":"Product","name":"Lamp","offers":{"@type":"AggregateOffer","lowPrice":"19.00","highPrice":"25.00"}}
            </script>"#;
        let got = parse_product_page(html, URL).unwrap();
        assert_eq!(got.price, Decimal::new(19, 0));
    }

    #[test]
    fn meta_tags_are_the_fallback() {
        let html = r#"<head>
            <meta content="Desk Chair" property="og:title">
            <meta property="product:price:amount" content="1,249.50" />
            </head>"#;
        let got = parse_product_page(html, URL).unwrap();
        assert_eq!(got.name, "Desk Chair");
        assert_eq!(got.price, Decimal::new(124_950, 2).normalize());
    }

    #[test]
    fn html_without_product_data_is_missing_data() {
        let html = "<html><head><title>Nothing here</title></head></html>";
        let err = parse_product_page(html, URL).unwrap_err();
        assert!(matches!(err, FetchError::MissingProductData { .. }));
    }

    #[test]
    fn parse_price_strips_currency_symbol() {
        assert_eq!(parse_price("$ 12.50", URL).unwrap(), Decimal::new(125, 1));
        assert_eq!(parse_price("45 USD", URL).unwrap(), Decimal::new(45, 0));
        assert_eq!(parse_price("1e2", URL).unwrap(), Decimal::new(100, 0));
    }

    #[test]
    fn parse_price_rejects_garbage_and_negatives() {
        assert!(matches!(
            parse_price("call us", URL),
            Err(FetchError::InvalidPrice { .. })
        ));
        assert!(matches!(
            parse_price("-3.00", URL),
            Err(FetchError::InvalidPrice { .. })
        ));
    }

    #[test]
    fn zero_price_is_accepted() {
        assert_eq!(parse_price("0.00", URL).unwrap(), Decimal::ZERO);
    }
}
