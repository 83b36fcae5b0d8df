//! Detail-page and listing-page extraction for nhadat247-style HTML.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use estate_core::{FieldValue, PropertyRecord, URL_FIELD};
use regex::{Captures, Regex};
use scraper::{ElementRef, Html, Selector};

use crate::flatten::NORMALIZED_PRICE_SOURCE_FIELD;
use crate::AdapterError;

pub const TITLE_FIELD: &str = "Tiêu đề";
pub const ADDRESS_FIELD: &str = "Địa chỉ";
pub const PRICE_FIELD: &str = "Mức giá";
pub const AREA_FIELD: &str = "Diện tích";
pub const POSTED_FIELD: &str = "Ngày đăng";
pub const LATITUDE_FIELD: &str = "latitude";
pub const LONGITUDE_FIELD: &str = "longitude";

pub const SITE_ROOT: &str = "https://nhadat247.com.vn";
const NEGOTIABLE_PRICE: &str = "Thỏa thuận";
const LOCATION_KEYWORDS: &[&str] = &["Thanh Xuân", "Hà Nội", "TP.HCM", "Đà Nẵng", "Cần Thơ"];

static AREA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?\s*(?:m²|m2|mét|vuông))").expect("area regex"));
static LISTING_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-pid(\d+)").expect("listing id regex"));
static ADDRESS_CLEANUP: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Bán\s+.*?\d+(?:\.\d+)?\s*(?:tỷ|triệu).*?\b",
        r"\d+(?:\.\d+)?\s*(?:tỷ|triệu).*",
        r"\d+\s*tầng.*",
        r"\d+m2.*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("address cleanup regex"))
    .collect()
});

struct CoordinatePattern {
    name: &'static str,
    regex: Regex,
    parse: fn(&Captures<'_>) -> Option<(f64, f64)>,
}

/// Tried in order; the first pattern yielding a pair inside Vietnam wins.
static COORDINATE_PATTERNS: LazyLock<Vec<CoordinatePattern>> = LazyLock::new(|| {
    let pattern = |name, re: &str| CoordinatePattern {
        name,
        regex: Regex::new(re).expect("coordinate regex"),
        parse: oriented_pair,
    };
    vec![
        pattern("maps_place", r"(?i)place\?q=([-+]?\d*\.\d+),([-+]?\d*\.\d+)"),
        pattern("lat_lng_pair", r"(?i)([-+]?\d{1,3}\.\d{4,}),\s*([-+]?\d{1,3}\.\d{4,})"),
        pattern("json_lat_lng", r#"(?i)"lat"\s*:\s*([-+]?\d*\.\d+).*?"lng"\s*:\s*([-+]?\d*\.\d+)"#),
        pattern(
            "json_latitude_longitude",
            r#"(?i)latitude["']\s*:\s*["']?([-+]?\d*\.\d+)["']?.*?longitude["']\s*:\s*["']?([-+]?\d*\.\d+)["']?"#,
        ),
        pattern("map_center", r"(?i)center=([-+]?\d*\.\d+),([-+]?\d*\.\d+)"),
        pattern("maps_at", r"(?i)@([-+]?\d*\.\d+),([-+]?\d*\.\d+)"),
    ]
});

fn in_vietnam(lat: f64, lng: f64) -> bool {
    (8.0..=24.0).contains(&lat) && (102.0..=110.0).contains(&lng)
}

fn oriented_pair(caps: &Captures<'_>) -> Option<(f64, f64)> {
    let a: f64 = caps.get(1)?.as_str().parse().ok()?;
    let b: f64 = caps.get(2)?.as_str().parse().ok()?;
    if in_vietnam(a, b) {
        Some((a, b))
    } else if in_vietnam(b, a) {
        Some((b, a))
    } else {
        None
    }
}

pub fn extract_coordinates(html: &str) -> Option<(f64, f64)> {
    for pattern in COORDINATE_PATTERNS.iter() {
        for caps in pattern.regex.captures_iter(html) {
            if let Some(pair) = (pattern.parse)(&caps) {
                tracing::trace!(pattern = pattern.name, ?pair, "coordinates matched");
                return Some(pair);
            }
        }
    }
    None
}

pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() {
        return String::new();
    }
    if url.starts_with("//") {
        return format!("https:{url}");
    }
    if url.starts_with("http") {
        return url.to_string();
    }
    if url.starts_with('/') {
        format!("{SITE_ROOT}{url}")
    } else {
        format!("{SITE_ROOT}/{url}")
    }
}

pub fn listing_id_from_url(url: &str) -> Option<String> {
    LISTING_ID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).find_map(element_text))
}

pub fn extract_property_urls(html: &str, limit: usize) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = selector(r#"a[href*="-pid"]"#)?;
    let mut urls: Vec<String> = Vec::new();
    for href in document.select(&sel).filter_map(|a| a.value().attr("href")) {
        if urls.len() >= limit {
            break;
        }
        let url = normalize_url(href);
        if !url.is_empty() && !urls.contains(&url) {
            urls.push(url);
        }
    }
    Ok(urls)
}

fn extract_address(document: &Html) -> Result<Option<String>, AdapterError> {
    if let Some(text) = select_first_text(document, "span.re__pr-short-description")? {
        let parts: Vec<&str> = text.split(',').take(3).collect();
        return Ok(text_or_none(parts.join(",")));
    }

    let spans = selector("span")?;
    for span in document.select(&spans) {
        let Some(text) = element_text(span) else {
            continue;
        };
        if !LOCATION_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            continue;
        }
        let cleaned = ADDRESS_CLEANUP
            .iter()
            .fold(text, |acc, re| re.replace_all(&acc, "").into_owned());
        let cleaned = cleaned.trim();
        if cleaned.chars().count() > 3 {
            return Ok(Some(cleaned.to_string()));
        }
    }
    Ok(None)
}

fn extract_price(document: &Html, html: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector("input.js-gia-bds")?;
    let Some(raw) = document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("value"))
        .and_then(|v| text_or_none(v.to_string()))
    else {
        return Ok(None);
    };
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if !digits.is_empty() {
        return Ok(Some(digits));
    }
    if html.to_lowercase().contains(&NEGOTIABLE_PRICE.to_lowercase()) {
        return Ok(Some(NEGOTIABLE_PRICE.to_string()));
    }
    Ok(Some(raw))
}

fn extract_area(document: &Html, html: &str) -> Result<Option<String>, AdapterError> {
    let items = selector(r#"div[class*="re__pr-short-info-item"]"#)?;
    let values = selector(r#"span[class*="value"]"#)?;
    for item in document.select(&items) {
        if !item.text().collect::<String>().contains(AREA_FIELD) {
            continue;
        }
        if let Some(value) = item.select(&values).find_map(element_text) {
            return Ok(Some(value));
        }
    }
    Ok(AREA_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string()))
}

/// Parse one property detail page into a raw record keyed by the site's own labels.
///
/// Coordinates are always present (possibly null) so batches keep a stable column set.
pub fn parse_property_page(
    url: &str,
    html: &str,
    fetched_at: DateTime<Utc>,
) -> Result<PropertyRecord, AdapterError> {
    let url = normalize_url(url);
    let document = Html::parse_document(html);
    let mut record = PropertyRecord::new();

    let title = match select_first_text(&document, "h1")? {
        Some(title) => Some(title),
        None => select_first_text(&document, "title")?,
    };
    if let Some(title) = title {
        record.insert(TITLE_FIELD, title);
    }
    if let Some(address) = extract_address(&document)? {
        record.insert(ADDRESS_FIELD, address);
    }
    if let Some(price) = extract_price(&document, html)? {
        if let Ok(amount) = price.parse::<i64>() {
            record.insert(NORMALIZED_PRICE_SOURCE_FIELD, amount);
        }
        record.insert(PRICE_FIELD, price);
    }
    if let Some(area) = extract_area(&document, html)? {
        record.insert(AREA_FIELD, area);
    }

    let coords = extract_coordinates(html);
    record.insert(LATITUDE_FIELD, FieldValue::from(coords.map(|c| c.0)));
    record.insert(LONGITUDE_FIELD, FieldValue::from(coords.map(|c| c.1)));

    if let Some(id) = listing_id_from_url(&url) {
        record.insert(estate_core::LEGACY_ID_FIELD, id);
    }
    record.insert(POSTED_FIELD, fetched_at.format("%Y-%m-%d").to_string());
    record.insert(URL_FIELD, url);
    Ok(record)
}
