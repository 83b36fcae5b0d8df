//! Identity-keyed deduplication, last occurrence wins.

use std::collections::{BTreeSet, HashMap};

use estate_core::{select_identity_field, PropertyRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub identity_field: Option<String>,
    pub input: usize,
    pub output: usize,
    pub removed: usize,
    pub without_identity: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator;

impl Deduplicator {
    /// Survivors keep the relative order of their last occurrences. Records with
    /// no identity value are never collapsed.
    pub fn dedupe(
        &self,
        records: Vec<PropertyRecord>,
        identity_field: &str,
    ) -> (Vec<PropertyRecord>, DedupReport) {
        let input = records.len();
        let keys: Vec<Option<String>> = records.iter().map(|r| r.text(identity_field)).collect();

        let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(input);
        for (idx, key) in keys.iter().enumerate() {
            if let Some(key) = key {
                last_seen.insert(key.as_str(), idx);
            }
        }

        let mut without_identity = 0;
        let kept: Vec<PropertyRecord> = records
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| match &keys[*idx] {
                Some(key) => last_seen.get(key.as_str()) == Some(idx),
                None => {
                    without_identity += 1;
                    true
                }
            })
            .map(|(_, record)| record)
            .collect();

        if without_identity > 0 {
            warn!(identity_field, without_identity, "records without identity kept as-is");
        }
        let report = DedupReport {
            identity_field: Some(identity_field.to_string()),
            input,
            output: kept.len(),
            removed: input - kept.len(),
            without_identity,
        };
        debug!(?report, "dedup complete");
        (kept, report)
    }

    pub fn dedupe_selecting(&self, records: Vec<PropertyRecord>) -> (Vec<PropertyRecord>, DedupReport) {
        let columns: BTreeSet<&str> = records.iter().flat_map(|r| r.field_names()).collect();
        match select_identity_field(columns) {
            Some(field) => self.dedupe(records, field),
            None => {
                warn!("no identity column in batch; deduplication skipped");
                let n = records.len();
                let report = DedupReport {
                    identity_field: None,
                    input: n,
                    output: n,
                    removed: 0,
                    without_identity: n,
                };
                (records, report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_core::PROPERTY_ID_FIELD;

    fn rec(pairs: &[(&str, &str)]) -> PropertyRecord {
        PropertyRecord::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn later_record_wins_for_same_identity() {
        let input = vec![
            rec(&[("id", "1"), ("price", "2 tỷ"), ("url", "u1")]),
            rec(&[("id", "1"), ("price", "3 tỷ"), ("url", "u1")]),
        ];
        let (out, report) = Deduplicator.dedupe(input, "id");
        assert_eq!(out, vec![rec(&[("id", "1"), ("price", "3 tỷ"), ("url", "u1")])]);
        assert_eq!(report.input, 2);
        assert_eq!(report.output, 1);
        assert_eq!(report.removed, 1);
    }

    #[test]
    fn survivors_are_unique_and_ordered_by_last_occurrence() {
        let input = vec![
            rec(&[("id", "a"), ("v", "1")]),
            rec(&[("id", "b"), ("v", "1")]),
            rec(&[("id", "a"), ("v", "2")]),
            rec(&[("id", "c"), ("v", "1")]),
            rec(&[("id", "b"), ("v", "2")]),
        ];
        let (out, report) = Deduplicator.dedupe(input, "id");
        let ids: Vec<_> = out.iter().filter_map(|r| r.text("id")).collect();
        let vs: Vec<_> = out.iter().filter_map(|r| r.text("v")).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(vs, vec!["2", "1", "2"]);
        assert!(report.output <= report.input);
    }

    #[test]
    fn records_without_identity_pass_through() {
        let input = vec![rec(&[("title", "x")]), rec(&[("title", "y")]), rec(&[("id", "1")])];
        let (out, report) = Deduplicator.dedupe(input, "id");
        assert_eq!(out.len(), 3);
        assert_eq!(report.without_identity, 2);
    }

    #[test]
    fn selection_prefers_property_id_then_url() {
        let input = vec![
            rec(&[(PROPERTY_ID_FIELD, "p1"), ("url", "u1")]),
            rec(&[(PROPERTY_ID_FIELD, "p1"), ("url", "u2")]),
        ];
        let (out, report) = Deduplicator.dedupe_selecting(input);
        assert_eq!(out.len(), 1);
        assert_eq!(report.identity_field.as_deref(), Some(PROPERTY_ID_FIELD));

        let by_url = vec![rec(&[("url", "u1")]), rec(&[("url", "u1"), ("t", "new")])];
        let (out, report) = Deduplicator.dedupe_selecting(by_url);
        assert_eq!(out[0].text("t").as_deref(), Some("new"));
        assert_eq!(report.identity_field.as_deref(), Some("url"));
    }

    #[test]
    fn no_identity_column_returns_input_unchanged() {
        let input = vec![rec(&[("title", "x")]), rec(&[("title", "x")])];
        let (out, report) = Deduplicator.dedupe_selecting(input.clone());
        assert_eq!(out, input);
        assert_eq!(report.removed, 0);
        assert_eq!(report.identity_field, None);
    }

    proptest::proptest! {
        #[test]
        fn survivors_have_unique_identities(ids in proptest::collection::vec(proptest::option::of("[a-e]"), 0..40)) {
            let input: Vec<PropertyRecord> = ids
                .iter()
                .enumerate()
                .map(|(n, id)| {
                    let mut record = PropertyRecord::from_pairs([("seq", n.to_string())]);
                    if let Some(id) = id {
                        record.insert("id", id.as_str());
                    }
                    record
                })
                .collect();
            let (out, report) = Deduplicator.dedupe(input, "id");

            let keyed: Vec<String> = out.iter().filter_map(|r| r.text("id")).collect();
            let distinct: BTreeSet<&str> = keyed.iter().map(String::as_str).collect();
            proptest::prop_assert_eq!(distinct.len(), keyed.len());
            proptest::prop_assert!(out.len() <= ids.len());
            proptest::prop_assert_eq!(report.output + report.removed, report.input);
            proptest::prop_assert_eq!(report.without_identity, ids.iter().filter(|id| id.is_none()).count());
        }
    }
}

