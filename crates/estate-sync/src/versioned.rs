//! Versioned property store on object storage and the upsert merge into it.
//!
//! Layout under the table prefix:
//! - `_log/<version>.json`: one commit entry per successful write
//! - `data/part-<version>-<uuid>.parquet`: full snapshot referenced by that commit
//!
//! Only the latest commit is visible. The store is absent until its first commit.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use estate_core::{
    backfill_identity, infer_column_type, infer_schema, ColumnDef, ColumnMapping, IdentitySource,
    PropertyRecord,
};
use estate_storage::{join_key, sha256_hex, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dedup::Deduplicator;
use crate::error::MergeError;
use crate::snapshot::{decode_snapshot, encode_snapshot};

const LOG_DIR: &str = "_log";
const DATA_DIR: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOperation {
    Create,
    Merge,
    Overwrite,
    UnionMerge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub version: u64,
    pub operation: CommitOperation,
    pub committed_at: DateTime<Utc>,
    pub data_file: String,
    /// SHA-256 of the snapshot bytes; checked on load.
    #[serde(default)]
    pub data_sha256: String,
    pub columns: Vec<ColumnDef>,
    pub row_count: usize,
    pub identity_field: String,
}

#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub commit: CommitEntry,
    pub records: Vec<PropertyRecord>,
}

impl StoreSnapshot {
    pub fn columns(&self) -> &[ColumnDef] {
        &self.commit.columns
    }
}

#[derive(Debug, Clone)]
pub struct VersionedStore {
    objects: Arc<dyn ObjectStore>,
    prefix: String,
}

impl VersionedStore {
    pub fn new(objects: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            objects,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn location(&self) -> String {
        format!("{}/{}", self.objects.location(), self.prefix)
    }

    fn key(&self, name: &str) -> String {
        join_key(&self.prefix, name)
    }

    fn log_key(&self, version: u64) -> String {
        self.key(&format!("{LOG_DIR}/{version:020}.json"))
    }

    async fn log_keys(&self) -> Result<Vec<String>, MergeError> {
        let prefix = self.key(&format!("{LOG_DIR}/"));
        let mut keys = self.objects.list(&prefix).await?;
        keys.retain(|k| k.ends_with(".json"));
        Ok(keys)
    }

    async fn read_commit(&self, key: &str) -> Result<Option<CommitEntry>, MergeError> {
        let Some(bytes) = self.objects.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| MergeError::CorruptLog {
                key: key.to_string(),
                source,
            })
    }

    pub async fn history(&self) -> Result<Vec<CommitEntry>, MergeError> {
        let mut commits = Vec::new();
        for key in self.log_keys().await? {
            if let Some(commit) = self.read_commit(&key).await? {
                commits.push(commit);
            }
        }
        commits.sort_by_key(|c| c.version);
        Ok(commits)
    }

    pub async fn latest_commit(&self) -> Result<Option<CommitEntry>, MergeError> {
        // Zero-padded versions sort lexically.
        match self.log_keys().await?.last() {
            Some(key) => self.read_commit(key).await,
            None => Ok(None),
        }
    }

    pub async fn load(&self) -> Result<Option<StoreSnapshot>, MergeError> {
        let Some(commit) = self.latest_commit().await? else {
            return Ok(None);
        };
        let data_key = self.key(&commit.data_file);
        let bytes = self
            .objects
            .get(&data_key)
            .await?
            .ok_or_else(|| MergeError::MissingDataFile {
                version: commit.version,
                key: data_key.clone(),
            })?;
        if !commit.data_sha256.is_empty() && sha256_hex(&bytes) != commit.data_sha256 {
            return Err(MergeError::ChecksumMismatch {
                version: commit.version,
                key: data_key,
            });
        }
        let (_, records) = decode_snapshot(bytes)?;
        debug!(version = commit.version, rows = records.len(), "store snapshot loaded");
        Ok(Some(StoreSnapshot { commit, records }))
    }

    pub async fn commit(
        &self,
        operation: CommitOperation,
        columns: Vec<ColumnDef>,
        records: &[PropertyRecord],
        identity_field: &str,
    ) -> Result<CommitEntry, MergeError> {
        let version = self
            .latest_commit()
            .await?
            .map(|c| c.version + 1)
            .unwrap_or(0);
        let log_key = self.log_key(version);
        if self.objects.get(&log_key).await?.is_some() {
            return Err(MergeError::Conflict(version));
        }

        let data_file = format!("{DATA_DIR}/part-{version:020}-{}.parquet", Uuid::new_v4());
        let bytes = encode_snapshot(&columns, records)?;
        let data_sha256 = sha256_hex(&bytes);
        self.objects.put(&self.key(&data_file), bytes).await?;

        let entry = CommitEntry {
            version,
            operation,
            committed_at: Utc::now(),
            data_file,
            data_sha256,
            columns,
            row_count: records.len(),
            identity_field: identity_field.to_string(),
        };
        let log = serde_json::to_vec_pretty(&entry).map_err(MergeError::Serialize)?;
        self.objects.put(&log_key, log).await?;
        info!(
            version,
            ?operation,
            rows = entry.row_count,
            columns = entry.columns.len(),
            store = %self.location(),
            "store commit written"
        );
        Ok(entry)
    }
}

/// What to do when an incoming batch's column count differs from the store's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaDriftPolicy {
    #[default]
    Overwrite,
    UnionColumns,
}

impl FromStr for SchemaDriftPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "union" | "union_columns" => Ok(Self::UnionColumns),
            other => Err(format!("unknown schema drift policy {other:?} (expected overwrite|union)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub operation: Option<CommitOperation>,
    pub version: Option<u64>,
    pub rows_before: usize,
    pub rows_after: usize,
    pub inserted: usize,
    pub updated: usize,
    pub backfilled_identity: usize,
    pub skipped_missing_identity: usize,
    pub columns: usize,
    pub added_columns: Vec<String>,
    pub dropped_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VersionedStoreMerger {
    identity_field: String,
    policy: SchemaDriftPolicy,
}

struct PreparedBatch {
    records: Vec<PropertyRecord>,
    backfilled: usize,
    skipped: usize,
}

struct Upserted {
    records: Vec<PropertyRecord>,
    inserted: usize,
    updated: usize,
}

impl VersionedStoreMerger {
    pub fn new(identity_field: impl Into<String>, policy: SchemaDriftPolicy) -> Self {
        Self {
            identity_field: identity_field.into(),
            policy,
        }
    }

    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    fn prepare(&self, incoming: Vec<PropertyRecord>) -> PreparedBatch {
        let mapping = ColumnMapping::build(incoming.iter().flat_map(|r| r.field_names()));
        let mut backfilled = 0;
        let mut skipped = 0;
        let mut records = Vec::with_capacity(incoming.len());
        for record in &incoming {
            let mut record = record.renamed(&mapping);
            match backfill_identity(&mut record, &self.identity_field) {
                IdentitySource::Existing => {}
                IdentitySource::Missing => {
                    skipped += 1;
                    continue;
                }
                IdentitySource::LegacyId | IdentitySource::UrlHash => backfilled += 1,
            }
            records.push(record);
        }
        if skipped > 0 {
            warn!(
                skipped,
                identity_field = %self.identity_field,
                "records without id or url cannot be merged; skipped"
            );
        }
        let (records, _) = Deduplicator.dedupe(records, &self.identity_field);
        PreparedBatch {
            records,
            backfilled,
            skipped,
        }
    }

    /// Matched keys are replaced whole, unmatched keys appended, other rows untouched.
    fn upsert(&self, existing: Vec<PropertyRecord>, incoming: Vec<PropertyRecord>) -> Upserted {
        let mut rows = existing;
        let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
        for (idx, row) in rows.iter_mut().enumerate() {
            backfill_identity(row, &self.identity_field);
            if let Some(key) = row.text(&self.identity_field) {
                index.insert(key, idx);
            }
        }

        let (mut inserted, mut updated) = (0, 0);
        for record in incoming {
            let Some(key) = record.text(&self.identity_field) else {
                continue;
            };
            match index.get(&key) {
                Some(&idx) => {
                    rows[idx] = record;
                    updated += 1;
                }
                None => {
                    index.insert(key, rows.len());
                    rows.push(record);
                    inserted += 1;
                }
            }
        }
        Upserted {
            records: rows,
            inserted,
            updated,
        }
    }

    pub async fn merge(
        &self,
        store: &VersionedStore,
        incoming: Vec<PropertyRecord>,
    ) -> Result<MergeOutcome, MergeError> {
        let received = incoming.len();
        let prepared = self.prepare(incoming);
        let mut outcome = MergeOutcome {
            backfilled_identity: prepared.backfilled,
            skipped_missing_identity: prepared.skipped,
            ..MergeOutcome::default()
        };
        if prepared.records.is_empty() {
            warn!(received, store = %store.location(), "empty batch; nothing merged");
            return Ok(outcome);
        }

        let incoming_columns = infer_schema(&prepared.records).columns;
        let incoming_names: Vec<&str> = incoming_columns.iter().map(|c| c.name.as_str()).collect();

        let (operation, columns, records) = match store.load().await? {
            None => {
                outcome.inserted = prepared.records.len();
                outcome.added_columns = incoming_names.iter().map(|s| s.to_string()).collect();
                info!(rows = prepared.records.len(), columns = incoming_columns.len(), "creating store");
                (CommitOperation::Create, incoming_columns, prepared.records)
            }
            Some(snapshot) => {
                outcome.rows_before = snapshot.records.len();
                let existing_names: Vec<&str> =
                    snapshot.columns().iter().map(|c| c.name.as_str()).collect();
                outcome.added_columns = difference(&incoming_names, &existing_names);
                let dropped = difference(&existing_names, &incoming_names);
                let drifted = incoming_columns.len() != snapshot.columns().len();

                if drifted && self.policy == SchemaDriftPolicy::Overwrite {
                    warn!(
                        store_columns = snapshot.columns().len(),
                        incoming_columns = incoming_columns.len(),
                        rows_discarded = snapshot.records.len(),
                        dropped_columns = ?dropped,
                        "SCHEMA DRIFT: column count changed; overwriting the whole store with the incoming batch"
                    );
                    outcome.dropped_columns = dropped;
                    outcome.inserted = prepared.records.len();
                    (CommitOperation::Overwrite, incoming_columns, prepared.records)
                } else {
                    let operation = if drifted {
                        warn!(
                            store_columns = snapshot.columns().len(),
                            incoming_columns = incoming_columns.len(),
                            added_columns = ?outcome.added_columns,
                            "schema drift reconciled by column union"
                        );
                        CommitOperation::UnionMerge
                    } else {
                        CommitOperation::Merge
                    };
                    let columns = union_columns(snapshot.columns(), &incoming_columns);
                    let upserted = self.upsert(snapshot.records, prepared.records);
                    outcome.inserted = upserted.inserted;
                    outcome.updated = upserted.updated;
                    let columns = retype_columns(columns, &upserted.records);
                    (operation, columns, upserted.records)
                }
            }
        };

        let commit = store
            .commit(operation, columns, &records, &self.identity_field)
            .await?;
        outcome.operation = Some(commit.operation);
        outcome.version = Some(commit.version);
        outcome.rows_after = commit.row_count;
        outcome.columns = commit.columns.len();
        Ok(outcome)
    }
}

fn difference(left: &[&str], right: &[&str]) -> Vec<String> {
    let right: HashSet<&str> = right.iter().copied().collect();
    left.iter()
        .filter(|name| !right.contains(*name))
        .map(|name| name.to_string())
        .collect()
}

fn union_columns(existing: &[ColumnDef], incoming: &[ColumnDef]) -> Vec<ColumnDef> {
    let mut columns = existing.to_vec();
    for column in incoming {
        match columns.iter_mut().find(|c| c.name == column.name) {
            Some(current) => current.column_type = current.column_type.widen(column.column_type),
            None => columns.push(column.clone()),
        }
    }
    columns
}

/// Re-infer each column's type from the merged rows; all-null columns keep their declared type.
fn retype_columns(columns: Vec<ColumnDef>, rows: &[PropertyRecord]) -> Vec<ColumnDef> {
    columns
        .into_iter()
        .map(|mut column| {
            let values: Vec<_> = rows
                .iter()
                .filter_map(|r| r.get(&column.name))
                .filter(|v| !v.is_null())
                .collect();
            if !values.is_empty() {
                column.column_type = infer_column_type(values);
            }
            column
        })
        .collect()
}
