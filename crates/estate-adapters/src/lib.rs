//! Extractor contract + fixture-first extractor implementations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{PropertyRecord, SearchCriteria};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

mod flatten;
mod html;
mod search;

pub use flatten::{flatten_json_record, NORMALIZED_PRICE_SOURCE_FIELD};
pub use html::{
    extract_coordinates, extract_property_urls, listing_id_from_url, normalize_url,
    parse_property_page, ADDRESS_FIELD, AREA_FIELD, LATITUDE_FIELD, LONGITUDE_FIELD, POSTED_FIELD,
    PRICE_FIELD, SITE_ROOT, TITLE_FIELD,
};
pub use search::{action_slug, category_code, city_code, is_search_page, search_url};

pub const CRATE_NAME: &str = "estate-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Records come back with raw field names and should carry a resolvable `url`.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, criteria: &SearchCriteria) -> Result<Vec<PropertyRecord>, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub listing_pages: Vec<FixturePage>,
    #[serde(default)]
    pub detail_pages: Vec<FixturePage>,
    #[serde(default)]
    pub records: Vec<JsonValue>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for page in bundle
        .listing_pages
        .iter_mut()
        .chain(bundle.detail_pages.iter_mut())
    {
        hydrate_inline_text(base, page)?;
    }
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_inline_text(base: &Path, page: &mut FixturePage) -> Result<()> {
    if page.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &page.path else {
        return Ok(());
    };
    let raw_path = base.join(rel_path);
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture page {}", raw_path.display()))?;
    page.inline_text = Some(raw);
    Ok(())
}

/// Without listing pages every detail page is parsed; otherwise only the
/// linked ones, up to `limit_each_page` per listing.
pub fn bundle_to_records(
    bundle: &FixtureBundle,
    limit_each_page: usize,
) -> Result<Vec<PropertyRecord>, AdapterError> {
    let details: HashMap<String, &FixturePage> = bundle
        .detail_pages
        .iter()
        .map(|p| (normalize_url(&p.url), p))
        .collect();

    let mut wanted: Vec<String> = Vec::new();
    if bundle.listing_pages.is_empty() {
        wanted.extend(bundle.detail_pages.iter().map(|p| normalize_url(&p.url)));
    }
    for listing in &bundle.listing_pages {
        let Some(html) = listing.inline_text.as_deref() else {
            warn!(url = %listing.url, "listing page has no body; skipping");
            continue;
        };
        let urls = extract_property_urls(html, limit_each_page)?;
        debug!(url = %listing.url, found = urls.len(), "listing page scanned");
        for url in urls {
            if !wanted.contains(&url) {
                wanted.push(url);
            }
        }
    }

    let mut records = Vec::new();
    for url in &wanted {
        let Some(page) = details.get(url) else {
            warn!(%url, fixture = %bundle.fixture_id, "no captured detail page for url");
            continue;
        };
        let Some(html) = page.inline_text.as_deref() else {
            warn!(%url, "detail page has no body; skipping");
            continue;
        };
        let record = parse_property_page(url, html, bundle.fetched_at)?;
        if !record.is_blank() {
            records.push(record);
        }
    }

    for (idx, value) in bundle.records.iter().enumerate() {
        match flatten_json_record(value) {
            Some(record) if !record.is_blank() => records.push(record),
            Some(_) => debug!(idx, "blank json record dropped"),
            None => warn!(idx, fixture = %bundle.fixture_id, "json record is not an object; skipping"),
        }
    }
    Ok(records)
}

// A bundle may hold pages captured for other searches; only the branch's own
// results pages select detail pages.
fn retain_search_pages(bundle: &mut FixtureBundle, criteria: &SearchCriteria) {
    if bundle.listing_pages.is_empty() {
        return;
    }
    let expected = search_url(criteria);
    bundle.listing_pages.retain(|page| {
        let keep = is_search_page(&page.url, criteria);
        if !keep {
            warn!(url = %page.url, %expected, "listing page is not a results page for this branch; skipping");
        }
        keep
    });
    if bundle.listing_pages.is_empty() {
        warn!(fixture = %bundle.fixture_id, %expected, "no results page for this branch; detail pages ignored");
        bundle.detail_pages.clear();
    }
}

#[derive(Debug, Clone)]
pub struct FixtureExtractor {
    root: PathBuf,
    limit_each_page: usize,
}

impl FixtureExtractor {
    pub fn new(root: impl Into<PathBuf>, limit_each_page: usize) -> Self {
        Self {
            root: root.into(),
            limit_each_page,
        }
    }

    pub fn bundle_path_for(&self, criteria: &SearchCriteria) -> PathBuf {
        self.root.join(criteria.key()).join("bundle.json")
    }
}

#[async_trait]
impl Extractor for FixtureExtractor {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn extract(&self, criteria: &SearchCriteria) -> Result<Vec<PropertyRecord>, AdapterError> {
        let path = self.bundle_path_for(criteria);
        if !path.exists() {
            warn!(path = %path.display(), branch = %criteria.key(), "no fixture bundle; branch yields no records");
            return Ok(Vec::new());
        }
        let mut bundle = load_fixture_bundle(&path)?;
        retain_search_pages(&mut bundle, criteria);
        let records = bundle_to_records(&bundle, self.limit_each_page)?;
        info!(branch = %criteria.key(), records = records.len(), "fixture bundle extracted");
        Ok(records)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticExtractor {
    by_key: HashMap<String, Vec<PropertyRecord>>,
}

impl StaticExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, criteria: &SearchCriteria, records: Vec<PropertyRecord>) -> Self {
        self.by_key.entry(criteria.key()).or_default().extend(records);
        self
    }
}

#[async_trait]
impl Extractor for StaticExtractor {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn extract(&self, criteria: &SearchCriteria) -> Result<Vec<PropertyRecord>, AdapterError> {
        Ok(self.by_key.get(&criteria.key()).cloned().unwrap_or_default())
    }
}
