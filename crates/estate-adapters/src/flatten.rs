//! Flattening of nested JSON listing payloads into flat records.

use estate_core::{FieldValue, PropertyRecord};
use serde_json::{Map, Value as JsonValue};

// Parquet rejects these in column names.
const PARQUET_SPECIAL_CHARACTERS: &[char] = &[' ', ',', ';', '{', '}', '(', ')', '\n', '\t', '='];

const DROPPED_FIELDS: &[&str] = &["FactId"];

const PRICE_SOURCES: &[&str] = &["listing_prices_buy_price", "listing_prices_rent_price"];

pub const NORMALIZED_PRICE_SOURCE_FIELD: &str = "propertyDetails_normalizedPrice";

/// Nested objects join with `_`, lists become JSON text. `None` for non-objects.
pub fn flatten_json_record(value: &JsonValue) -> Option<PropertyRecord> {
    let object = value.as_object()?;
    let mut record = PropertyRecord::new();
    flatten_into(&mut record, None, object);

    for dropped in DROPPED_FIELDS {
        record.remove(dropped);
    }
    if !record.contains(NORMALIZED_PRICE_SOURCE_FIELD) {
        if let Some(source) = PRICE_SOURCES.iter().find(|s| record.contains(s)) {
            record.rename(source, NORMALIZED_PRICE_SOURCE_FIELD);
        }
    }
    Some(record)
}

fn flatten_into(record: &mut PropertyRecord, prefix: Option<&str>, object: &Map<String, JsonValue>) {
    for (key, value) in object {
        let name = match prefix {
            Some(prefix) => format!("{prefix}_{}", clean_key(key)),
            None => clean_key(key),
        };
        match value {
            JsonValue::Object(child) if !child.is_empty() => flatten_into(record, Some(&name), child),
            other => record.insert(name, FieldValue::from_json(other)),
        }
    }
}

fn clean_key(key: &str) -> String {
    key.chars()
        .filter(|c| !PARQUET_SPECIAL_CHARACTERS.contains(c))
        .map(|c| if c == '.' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_objects_flatten_with_underscores() {
        let record = flatten_json_record(&json!({
            "id": "123",
            "FactId": 9,
            "propertyDetails": {
                "propertyId": 123,
                "images": ["a.jpg", "b.jpg"],
                "commute times": {"walk": 5}
            },
            "listing": {"prices": {"buy": {"price": 2500000000i64}}}
        }))
        .expect("object");

        assert_eq!(record.get("propertyDetails_propertyId"), Some(&FieldValue::Integer(123)));
        assert_eq!(
            record.text("propertyDetails_images").as_deref(),
            Some("[\"a.jpg\",\"b.jpg\"]")
        );
        assert_eq!(record.get("propertyDetails_commutetimes_walk"), Some(&FieldValue::Integer(5)));
        assert!(!record.contains("FactId"));
        assert!(!record.contains("listing_prices_buy_price"));
        assert_eq!(
            record.get(NORMALIZED_PRICE_SOURCE_FIELD),
            Some(&FieldValue::Integer(2_500_000_000))
        );
    }

    #[test]
    fn rent_price_is_used_when_buy_price_missing() {
        let record = flatten_json_record(&json!({
            "listing": {"prices": {"rent": {"price": 15000000}}}
        }))
        .expect("object");
        assert_eq!(
            record.get(NORMALIZED_PRICE_SOURCE_FIELD),
            Some(&FieldValue::Integer(15_000_000))
        );
    }

    #[test]
    fn dotted_keys_become_underscored() {
        let record = flatten_json_record(&json!({"geo.lat": 21.02})).expect("object");
        assert_eq!(record.get("geo_lat"), Some(&FieldValue::Float(21.02)));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(flatten_json_record(&json!([1, 2])).is_none());
        assert!(flatten_json_record(&json!("x")).is_none());
    }
}
