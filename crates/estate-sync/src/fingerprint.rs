//! Change detection against the last stored state.

use std::collections::HashMap;

use estate_core::PropertyRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// `identity + "-" + volatile`, with a missing volatile value rendered as empty.
pub fn fingerprint(identity: &str, volatile: Option<&str>) -> String {
    format!("{identity}-{}", volatile.unwrap_or_default())
}

pub type FingerprintIndex = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub new: Vec<PropertyRecord>,
    pub changed: Vec<PropertyRecord>,
    pub unchanged: usize,
    pub skipped: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty()
    }

    pub fn summary(&self) -> ChangeSetSummary {
        ChangeSetSummary {
            new: self.new.len(),
            changed: self.changed.len(),
            unchanged: self.unchanged,
            skipped: self.skipped,
        }
    }

    pub fn into_records(self) -> Vec<PropertyRecord> {
        let mut records = self.new;
        records.extend(self.changed);
        records
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetSummary {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct FingerprintComparator {
    identity_field: String,
    volatile_field: String,
}

impl FingerprintComparator {
    pub fn new(identity_field: impl Into<String>, volatile_field: impl Into<String>) -> Self {
        Self {
            identity_field: identity_field.into(),
            volatile_field: volatile_field.into(),
        }
    }

    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    pub fn fingerprint_of(&self, record: &PropertyRecord) -> Option<(String, String)> {
        let identity = record.text(&self.identity_field)?;
        let volatile = record.text(&self.volatile_field);
        let fp = fingerprint(&identity, volatile.as_deref());
        Some((identity, fp))
    }

    /// Build the reference index from stored records; later rows win on repeated identities.
    pub fn index<'a>(&self, records: impl IntoIterator<Item = &'a PropertyRecord>) -> FingerprintIndex {
        records
            .into_iter()
            .filter_map(|r| self.fingerprint_of(r))
            .collect()
    }

    pub fn classify(&self, candidates: Vec<PropertyRecord>, reference: &FingerprintIndex) -> ChangeSet {
        let mut set = ChangeSet::default();
        for record in candidates {
            let Some((identity, fp)) = self.fingerprint_of(&record) else {
                warn!(
                    identity_field = %self.identity_field,
                    "candidate has no identity value; excluded from change detection"
                );
                set.skipped += 1;
                continue;
            };
            match reference.get(&identity) {
                None => set.new.push(record),
                Some(previous) if *previous != fp => {
                    debug!(%identity, %previous, current = %fp, "fingerprint changed");
                    set.changed.push(record);
                }
                Some(_) => set.unchanged += 1,
            }
        }
        set
    }
}
