//! Storage-safe identifiers for free-form field names.

use std::collections::{BTreeMap, HashSet};

use unicode_normalization::UnicodeNormalization;

pub const EMPTY_NAME_FALLBACK: &str = "column";

/// Normalize an arbitrary field name into `[a-z0-9_]+`. Never empty.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.nfd().filter(|c| c.is_ascii()) {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        EMPTY_NAME_FALLBACK.to_string()
    } else {
        out
    }
}

/// Two originals that sanitize to the same identifier get `_2`, `_3`, ...
/// suffixes in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    forward: BTreeMap<String, String>,
    ordered: Vec<(String, String)>,
}

impl ColumnMapping {
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut mapping = Self::default();
        let mut taken: HashSet<String> = HashSet::new();
        for name in names {
            if mapping.forward.contains_key(name) {
                continue;
            }
            let base = sanitize(name);
            let mut candidate = base.clone();
            let mut n = 2usize;
            while taken.contains(&candidate) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            taken.insert(candidate.clone());
            mapping.forward.insert(name.to_string(), candidate.clone());
            mapping.ordered.push((name.to_string(), candidate));
        }
        mapping
    }

    pub fn get(&self, original: &str) -> Option<&str> {
        self.forward.get(original).map(String::as_str)
    }

    pub fn columns(&self) -> Vec<&str> {
        self.ordered.iter().map(|(_, s)| s.as_str()).collect()
    }

    pub fn iter_in_order(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ordered.iter().map(|(o, s)| (o.as_str(), s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_vietnamese_diacritics() {
        assert_eq!(sanitize("Diện tích"), "dien_tich");
        assert_eq!(sanitize("Mức giá"), "muc_gia");
        assert_eq!(sanitize("Ngày đăng"), "ngay_ang");
        assert_eq!(sanitize("Địa chỉ"), "ia_chi");
    }

    #[test]
    fn collapses_and_trims_separators() {
        assert_eq!(sanitize("__propertyDetails.propertyId__"), "propertydetails_propertyid");
        assert_eq!(sanitize("a  --  b"), "a_b");
        assert_eq!(sanitize("listing{prices}(buy)=price"), "listing_prices_buy_price");
    }

    #[test]
    fn never_returns_empty() {
        assert_eq!(sanitize(""), "column");
        assert_eq!(sanitize("___"), "column");
        assert_eq!(sanitize("Đ"), "column");
    }

    #[test]
    fn leading_digits_get_no_prefix() {
        assert_eq!(sanitize("123 abc"), "123_abc");
        assert_eq!(sanitize("2PN"), "2pn");
    }

    #[test]
    fn is_idempotent() {
        for input in [
            "Diện tích",
            "  weird__Name!! ",
            "",
            "column",
            "propertyDetails_normalizedPrice",
            "ÀÉÎÕÜ ñ ç",
            "123 abc",
        ] {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "input {input:?}");
            assert!(!once.is_empty());
        }
    }

    #[test]
    fn mapping_disambiguates_collisions() {
        let mapping = ColumnMapping::build(["Giá", "Gia", "url", "Giá"]);
        assert_eq!(mapping.get("Giá"), Some("gia"));
        assert_eq!(mapping.get("Gia"), Some("gia_2"));
        assert_eq!(mapping.get("url"), Some("url"));
        assert_eq!(mapping.columns(), vec!["gia", "gia_2", "url"]);
    }

    proptest::proptest! {
        #[test]
        fn sanitized_names_are_stable_identifiers(name in "\\PC{0,40}") {
            let once = sanitize(&name);
            proptest::prop_assert!(!once.is_empty());
            proptest::prop_assert!(once
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            proptest::prop_assert!(!once.starts_with('_') && !once.ends_with('_'));
            proptest::prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn mapping_never_shares_a_column(names in proptest::collection::vec("[A-Za-zàáđĐ _.]{0,8}", 0..12)) {
            let mapping = ColumnMapping::build(names.iter().map(String::as_str));
            let columns = mapping.columns();
            let distinct: HashSet<&str> = columns.iter().copied().collect();
            proptest::prop_assert_eq!(distinct.len(), columns.len());
        }
    }
}
