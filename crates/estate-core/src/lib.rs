//! Core domain model for scraped property listings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

mod sanitize;
mod schema;

pub use sanitize::{sanitize, ColumnMapping, EMPTY_NAME_FALLBACK};
pub use schema::{infer_column_type, infer_schema, ColumnDef, ColumnType, InferredSchema};

pub const CRATE_NAME: &str = "estate-core";

// Sanitized forms of the extractor field names.
pub const PROPERTY_ID_FIELD: &str = "propertydetails_propertyid";
pub const URL_FIELD: &str = "url";
pub const LEGACY_ID_FIELD: &str = "id";
pub const NORMALIZED_PRICE_FIELD: &str = "propertydetails_normalizedprice";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Map a JSON value; arrays and objects are kept as serialized JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Boolean(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => n.as_f64().map(FieldValue::Float).unwrap_or(FieldValue::Null),
            },
            JsonValue::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            FieldValue::Integer(i) => JsonValue::from(*i),
            FieldValue::Float(f) => JsonValue::from(*f),
            FieldValue::Boolean(b) => JsonValue::Bool(*b),
            FieldValue::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn kind(&self) -> Option<ColumnType> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(_) => Some(ColumnType::Text),
            FieldValue::Integer(_) => Some(ColumnType::BigInt),
            FieldValue::Float(_) => Some(ColumnType::Double),
            FieldValue::Boolean(_) => Some(ColumnType::Boolean),
            FieldValue::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Boolean(b) => Some(b.to_string()),
            FieldValue::Timestamp(ts) => Some(ts.to_rfc3339()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl PropertyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(FieldValue::as_text)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.fields.remove(from) {
            Some(value) => {
                self.fields.insert(to.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_blank(&self) -> bool {
        self.fields.values().all(FieldValue::is_null)
    }

    /// Fields the mapping does not know are sanitized on the fly.
    pub fn renamed(&self, mapping: &ColumnMapping) -> PropertyRecord {
        PropertyRecord {
            fields: self
                .fields
                .iter()
                .map(|(k, v)| {
                    let name = mapping
                        .get(k)
                        .map(str::to_string)
                        .unwrap_or_else(|| sanitize(k));
                    (name, v.clone())
                })
                .collect(),
        }
    }
}

/// Sanitize a batch through one mapping built from the union of its field
/// names, so an original name lands in the same column in every record.
pub fn sanitize_batch(records: &[PropertyRecord]) -> Vec<PropertyRecord> {
    let mapping = ColumnMapping::build(records.iter().flat_map(|r| r.field_names()));
    records.iter().map(|r| r.renamed(&mapping)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Existing,
    LegacyId,
    UrlHash,
    Missing,
}

pub fn select_identity_field<'a>(columns: impl IntoIterator<Item = &'a str>) -> Option<&'static str> {
    let mut has_url = false;
    for column in columns {
        if column == PROPERTY_ID_FIELD {
            return Some(PROPERTY_ID_FIELD);
        }
        if column == URL_FIELD {
            has_url = true;
        }
    }
    has_url.then_some(URL_FIELD)
}

pub fn url_identity(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim().as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

pub fn backfill_identity(record: &mut PropertyRecord, identity_field: &str) -> IdentitySource {
    if record.text(identity_field).is_some() {
        return IdentitySource::Existing;
    }
    if let Some(id) = record.text(LEGACY_ID_FIELD) {
        record.insert(identity_field, id);
        return IdentitySource::LegacyId;
    }
    if let Some(url) = record.text(URL_FIELD) {
        record.insert(identity_field, url_identity(&url));
        return IdentitySource::UrlHash;
    }
    IdentitySource::Missing
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    pub city: String,
    pub property_type: String,
    pub rent_or_buy: String,
    #[serde(default)]
    pub radius: u32,
}

impl SearchCriteria {
    pub const CITY_TAG: &'static str = "search_city";
    pub const PROPERTY_TYPE_TAG: &'static str = "search_property_type";
    pub const RENT_OR_BUY_TAG: &'static str = "search_rent_or_buy";
    pub const RADIUS_TAG: &'static str = "search_radius";

    pub fn key(&self) -> String {
        [
            self.city.as_str(),
            self.rent_or_buy.as_str(),
            self.property_type.as_str(),
            &self.radius.to_string(),
        ]
        .join("_")
        .replace('-', "_")
        .to_lowercase()
    }

    pub fn tag(&self, record: &mut PropertyRecord) {
        record.insert(Self::CITY_TAG, self.city.clone());
        record.insert(Self::PROPERTY_TYPE_TAG, self.property_type.clone());
        record.insert(Self::RENT_OR_BUY_TAG, self.rent_or_buy.clone());
        record.insert(Self::RADIUS_TAG, i64::from(self.radius));
    }

    pub fn matches(&self, record: &PropertyRecord) -> bool {
        let eq = |tag: &str, want: &str| {
            record
                .text(tag)
                .map(|v| v.eq_ignore_ascii_case(want))
                .unwrap_or(false)
        };
        eq(Self::CITY_TAG, &self.city)
            && eq(Self::PROPERTY_TYPE_TAG, &self.property_type)
            && eq(Self::RENT_OR_BUY_TAG, &self.rent_or_buy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_scalars_and_nested_values_map_to_fields() {
        assert_eq!(FieldValue::from_json(&serde_json::json!(3)), FieldValue::Integer(3));
        assert_eq!(FieldValue::from_json(&serde_json::json!(2.5)), FieldValue::Float(2.5));
        assert_eq!(FieldValue::from_json(&serde_json::json!(null)), FieldValue::Null);
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(["a", 1])),
            FieldValue::Text("[\"a\",1]".into())
        );
    }

    #[test]
    fn whole_floats_render_without_fraction() {
        assert_eq!(FieldValue::Float(2_000_000_000.0).as_text().as_deref(), Some("2000000000"));
        assert_eq!(FieldValue::Float(1.5).as_text().as_deref(), Some("1.5"));
    }

    #[test]
    fn identity_field_selection_prefers_property_id() {
        assert_eq!(
            select_identity_field(["url", PROPERTY_ID_FIELD]),
            Some(PROPERTY_ID_FIELD)
        );
        assert_eq!(select_identity_field(["title", "url"]), Some(URL_FIELD));
        assert_eq!(select_identity_field(["title"]), None);
    }

    #[test]
    fn backfill_follows_fallback_order() {
        let mut existing = PropertyRecord::from_pairs([(PROPERTY_ID_FIELD, "p-1"), ("id", "x")]);
        assert_eq!(backfill_identity(&mut existing, PROPERTY_ID_FIELD), IdentitySource::Existing);
        assert_eq!(existing.text(PROPERTY_ID_FIELD).as_deref(), Some("p-1"));

        let mut legacy = PropertyRecord::from_pairs([("id", FieldValue::Integer(42))]);
        assert_eq!(backfill_identity(&mut legacy, PROPERTY_ID_FIELD), IdentitySource::LegacyId);
        assert_eq!(legacy.text(PROPERTY_ID_FIELD).as_deref(), Some("42"));

        let mut by_url = PropertyRecord::from_pairs([("url", "https://nhadat247.com.vn/a-pid1")]);
        assert_eq!(backfill_identity(&mut by_url, PROPERTY_ID_FIELD), IdentitySource::UrlHash);
        let derived = by_url.text(PROPERTY_ID_FIELD).unwrap();
        assert_eq!(derived.len(), 16);
        assert_eq!(derived, url_identity("https://nhadat247.com.vn/a-pid1"));

        let mut nothing = PropertyRecord::from_pairs([("title", "x")]);
        assert_eq!(backfill_identity(&mut nothing, PROPERTY_ID_FIELD), IdentitySource::Missing);
        assert!(!nothing.contains(PROPERTY_ID_FIELD));
    }

    #[test]
    fn criteria_key_and_tags() {
        let criteria = SearchCriteria {
            city: "Ha-Noi".into(),
            property_type: "nha-rieng".into(),
            rent_or_buy: "buy".into(),
            radius: 5,
        };
        assert_eq!(criteria.key(), "ha_noi_buy_nha_rieng_5");

        let mut record = PropertyRecord::from_pairs([("url", "u1")]);
        criteria.tag(&mut record);
        assert_eq!(record.text("search_city").as_deref(), Some("Ha-Noi"));
        assert_eq!(record.get("search_radius"), Some(&FieldValue::Integer(5)));
        assert!(criteria.matches(&record));

        let other = SearchCriteria {
            city: "Da-Nang".into(),
            ..criteria.clone()
        };
        assert!(!other.matches(&record));
    }

    #[test]
    fn sanitized_batch_keeps_values() {
        let records = [PropertyRecord::from_pairs([("Mức giá", "2 tỷ"), ("URL", "u1")])];
        let clean = sanitize_batch(&records);
        assert_eq!(clean[0].text("muc_gia").as_deref(), Some("2 tỷ"));
        assert_eq!(clean[0].text("url").as_deref(), Some("u1"));
    }

    #[test]
    fn colliding_names_map_to_one_column_across_records() {
        let records = [
            PropertyRecord::from_pairs([("Gia", "a"), ("gia", "b")]),
            PropertyRecord::from_pairs([("gia", "c")]),
            PropertyRecord::from_pairs([("Gia", "d")]),
        ];
        let clean = sanitize_batch(&records);
        assert_eq!(clean[0].text("gia").as_deref(), Some("a"));
        assert_eq!(clean[0].text("gia_2").as_deref(), Some("b"));
        assert_eq!(clean[1].text("gia_2").as_deref(), Some("c"));
        assert!(!clean[1].contains("gia"));
        assert_eq!(clean[2].text("gia").as_deref(), Some("d"));
    }
}
