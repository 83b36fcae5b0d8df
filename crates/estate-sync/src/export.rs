//! Projection of store records into a relational table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use estate_core::{infer_schema, sanitize, ColumnDef, ColumnType, FieldValue, PropertyRecord};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::dedup::Deduplicator;
use crate::error::ExportError;

/// Postgres caps bind parameters per statement at this value.
pub const MAX_BIND_PARAMS: usize = 65_535;

pub const DEFAULT_INDEX_COLUMNS: &[&str] = &["ia_chi", "url", "latitude", "longitude"];

/// Destination-side operations the exporter needs. Table and column names
/// arrive already sanitized.
#[async_trait]
pub trait RelationalTarget: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error>;

    async fn truncate(&self, table: &str) -> Result<(), sqlx::Error>;

    async fn recreate_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
        primary_key: Option<&str>,
    ) -> Result<(), sqlx::Error>;

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[ColumnDef],
        rows: &[Vec<FieldValue>],
    ) -> Result<u64, sqlx::Error>;

    async fn create_index(&self, table: &str, column: &str) -> Result<(), sqlx::Error>;

    async fn count_rows(&self, table: &str) -> Result<u64, sqlx::Error>;
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_table_sql(table: &str, columns: &[ColumnDef], primary_key: Option<&str>) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.name), c.column_type.sql_type());
            if primary_key == Some(c.name.as_str()) {
                def.push_str(" PRIMARY KEY");
            }
            def
        })
        .collect();
    format!("CREATE TABLE {} ({})", quote_ident(table), defs.join(", "))
}

pub fn index_name(table: &str, column: &str) -> String {
    format!("idx_{table}_{column}")
}

pub fn create_index_sql(table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index_name(table, column)),
        quote_ident(table),
        quote_ident(column)
    )
}

pub fn rows_per_batch(batch_size: usize, column_count: usize) -> usize {
    let cap = MAX_BIND_PARAMS / column_count.max(1);
    batch_size.clamp(1, cap.max(1))
}

#[derive(Debug, Clone)]
pub struct PgTarget {
    pool: PgPool,
}

impl PgTarget {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, ExportError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(database_url)
            .map_err(ExportError::Connect)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RelationalTarget for PgTarget {
    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                 WHERE table_schema = current_schema()
                   AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        row.try_get::<bool, _>(0)
    }

    async fn truncate(&self, table: &str) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recreate_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
        primary_key: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(table, columns, primary_key))
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[ColumnDef],
        rows: &[Vec<FieldValue>],
    ) -> Result<u64, sqlx::Error> {
        if rows.is_empty() {
            return Ok(0);
        }
        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(table),
            column_list.join(", ")
        ));
        query_builder.push_values(rows, |mut b, row| {
            for (column, value) in columns.iter().zip(row) {
                match column.column_type {
                    ColumnType::Text => b.push_bind(value.as_text()),
                    ColumnType::BigInt => b.push_bind(value.as_i64()),
                    ColumnType::Double => b.push_bind(value.as_f64()),
                    ColumnType::Boolean => b.push_bind(value.as_bool()),
                    ColumnType::Timestamp => {
                        b.push_bind(value.as_timestamp().map(|ts| ts.naive_utc()))
                    }
                };
            }
        });
        let result = query_builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn create_index(&self, table: &str, column: &str) -> Result<(), sqlx::Error> {
        sqlx::query(&create_index_sql(table, column))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<u64, sqlx::Error> {
        let row = sqlx::query(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<String>,
    pub rows: Vec<Vec<FieldValue>>,
    pub indexes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryTarget {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    fail_lookup: bool,
    fail_create: bool,
    fail_index_on: Vec<String>,
    fail_insert_batch: Option<usize>,
    inserts_seen: Mutex<usize>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_lookup(mut self) -> Self {
        self.fail_lookup = true;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_index_on(mut self, column: impl Into<String>) -> Self {
        self.fail_index_on.push(column.into());
        self
    }

    pub fn failing_insert_batch(mut self, ordinal: usize) -> Self {
        self.fail_insert_batch = Some(ordinal);
        self
    }

    pub async fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables.lock().await.get(name).cloned()
    }

    pub async fn seed_table(&self, name: &str, table: MemoryTable) {
        self.tables.lock().await.insert(name.to_string(), table);
    }
}

fn missing_table(table: &str) -> sqlx::Error {
    sqlx::Error::Protocol(format!("relation \"{table}\" does not exist"))
}

#[async_trait]
impl RelationalTarget for MemoryTarget {
    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        if self.fail_lookup {
            return Err(sqlx::Error::Protocol(format!("catalog lookup for {table} timed out")));
        }
        Ok(self.tables.lock().await.contains_key(table))
    }

    async fn truncate(&self, table: &str) -> Result<(), sqlx::Error> {
        let mut tables = self.tables.lock().await;
        let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        entry.rows.clear();
        Ok(())
    }

    async fn recreate_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
        primary_key: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        if self.fail_create {
            return Err(sqlx::Error::Protocol(format!("permission denied for table {table}")));
        }
        self.tables.lock().await.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                primary_key: primary_key.map(str::to_string),
                ..MemoryTable::default()
            },
        );
        Ok(())
    }

    async fn insert_batch(
        &self,
        table: &str,
        _columns: &[ColumnDef],
        rows: &[Vec<FieldValue>],
    ) -> Result<u64, sqlx::Error> {
        let ordinal = {
            let mut seen = self.inserts_seen.lock().await;
            let ordinal = *seen;
            *seen += 1;
            ordinal
        };
        if self.fail_insert_batch == Some(ordinal) {
            return Err(sqlx::Error::Protocol(format!("connection reset during batch {ordinal}")));
        }

        let mut tables = self.tables.lock().await;
        let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        if let Some(pk) = entry.primary_key.clone() {
            let pk_idx = entry.columns.iter().position(|c| c.name == pk);
            if let Some(pk_idx) = pk_idx {
                for row in rows {
                    let key = row.get(pk_idx).and_then(FieldValue::as_text);
                    let Some(key) = key else {
                        return Err(sqlx::Error::Protocol(format!("null value in column \"{pk}\"")));
                    };
                    let clash = entry
                        .rows
                        .iter()
                        .any(|existing| existing.get(pk_idx).and_then(FieldValue::as_text).as_ref() == Some(&key));
                    if clash {
                        return Err(sqlx::Error::Protocol(format!(
                            "duplicate key value violates unique constraint on \"{pk}\": {key}"
                        )));
                    }
                    entry.rows.push(row.clone());
                }
                return Ok(rows.len() as u64);
            }
        }
        entry.rows.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn create_index(&self, table: &str, column: &str) -> Result<(), sqlx::Error> {
        if self.fail_index_on.iter().any(|c| c == column) {
            return Err(sqlx::Error::Protocol(format!("cannot index column {column}")));
        }
        let mut tables = self.tables.lock().await;
        let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        entry.indexes.push(index_name(table, column));
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<u64, sqlx::Error> {
        let tables = self.tables.lock().await;
        let entry = tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(entry.rows.len() as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub table_name: String,
    pub rows_written: u64,
    pub rows_expected: u64,
    pub rows_verified: Option<u64>,
    pub matches: bool,
    pub truncated_existing: bool,
    pub table_created: bool,
    pub primary_key: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub batches: usize,
    pub skipped_missing_identity: usize,
    pub indexes_created: Vec<String>,
    pub index_failures: Vec<String>,
}

#[derive(Clone)]
pub struct RelationalExporter {
    target: Arc<dyn RelationalTarget>,
    identity_field: String,
    batch_size: usize,
    index_columns: Vec<String>,
}

impl RelationalExporter {
    pub fn new(target: Arc<dyn RelationalTarget>, identity_field: impl Into<String>) -> Self {
        Self {
            target,
            identity_field: identity_field.into(),
            batch_size: 1000,
            index_columns: DEFAULT_INDEX_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_index_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.index_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// `rows_expected` is the caller's own count and only feeds the report.
    pub async fn export(
        &self,
        records: &[PropertyRecord],
        table_name: &str,
        rows_expected: u64,
    ) -> Result<ExportReport, ExportError> {
        let table = sanitize(table_name);
        let span = info_span!("export", %table, records = records.len());
        self.export_inner(records, table, rows_expected)
            .instrument(span)
            .await
    }

    async fn export_inner(
        &self,
        records: &[PropertyRecord],
        table: String,
        rows_expected: u64,
    ) -> Result<ExportReport, ExportError> {
        let mut report = ExportReport {
            table_name: table.clone(),
            rows_expected,
            ..ExportReport::default()
        };

        let exists = self
            .target
            .table_exists(&table)
            .await
            .map_err(|source| ExportError::Inspect {
                table: table.clone(),
                source,
            })?;
        if exists {
            self.target
                .truncate(&table)
                .await
                .map_err(|source| ExportError::Truncate {
                    table: table.clone(),
                    source,
                })?;
            report.truncated_existing = true;
            debug!("existing table truncated");
        }

        if records.is_empty() {
            warn!("no records to export");
            report.matches = rows_expected == 0;
            return Ok(report);
        }

        let schema = infer_schema(records);
        let renamed: Vec<PropertyRecord> = records.iter().map(|r| r.renamed(&schema.mapping)).collect();
        let primary_key = schema
            .contains(&self.identity_field)
            .then(|| self.identity_field.clone());

        let rows = match &primary_key {
            Some(pk) => {
                let total = renamed.len();
                let keyed: Vec<PropertyRecord> =
                    renamed.into_iter().filter(|r| r.text(pk).is_some()).collect();
                report.skipped_missing_identity = total - keyed.len();
                if report.skipped_missing_identity > 0 {
                    warn!(
                        skipped = report.skipped_missing_identity,
                        primary_key = %pk,
                        "rows without a primary key value are not exported"
                    );
                }
                Deduplicator.dedupe(keyed, pk).0
            }
            None => renamed,
        };

        self.target
            .recreate_table(&table, &schema.columns, primary_key.as_deref())
            .await
            .map_err(|source| {
                error!(error = %source, "table creation failed");
                ExportError::CreateTable {
                    table: table.clone(),
                    source,
                }
            })?;
        report.table_created = true;
        report.primary_key = primary_key;
        report.columns = schema.columns.clone();

        let chunk = rows_per_batch(self.batch_size, schema.columns.len());
        for (batch, slice) in rows.chunks(chunk).enumerate() {
            let cells: Vec<Vec<FieldValue>> = slice
                .iter()
                .map(|record| {
                    schema
                        .columns
                        .iter()
                        .map(|c| record.get(&c.name).cloned().unwrap_or(FieldValue::Null))
                        .collect()
                })
                .collect();
            let written = self
                .target
                .insert_batch(&table, &schema.columns, &cells)
                .await
                .map_err(|source| {
                    error!(batch, rows_written = report.rows_written, error = %source, "batch insert failed");
                    ExportError::BatchInsert {
                        table: table.clone(),
                        batch,
                        rows_written: report.rows_written,
                        source,
                    }
                })?;
            report.rows_written += written;
            report.batches += 1;
            debug!(batch, rows = written, "batch inserted");
        }

        for column in &self.index_columns {
            if !schema.contains(column) {
                continue;
            }
            match self.target.create_index(&table, column).await {
                Ok(()) => report.indexes_created.push(index_name(&table, column)),
                Err(err) => {
                    warn!(%column, error = %err, "index creation failed; continuing");
                    report.index_failures.push(column.clone());
                }
            }
        }

        match self.target.count_rows(&table).await {
            Ok(count) => report.rows_verified = Some(count),
            Err(err) => warn!(error = %err, "row count verification failed"),
        }
        let observed = report.rows_verified.unwrap_or(report.rows_written);
        report.matches = observed == rows_expected;
        if report.matches {
            info!(rows = observed, batches = report.batches, "export verified");
        } else {
            warn!(rows = observed, expected = rows_expected, "exported row count does not match expectation");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_core::PROPERTY_ID_FIELD;

    fn records(n: usize) -> Vec<PropertyRecord> {
        (0..n)
            .map(|i| {
                PropertyRecord::from_pairs([
                    (PROPERTY_ID_FIELD, FieldValue::from(format!("p{i}"))),
                    ("Địa chỉ", FieldValue::from("Thanh Xuân, Hà Nội")),
                    ("latitude", FieldValue::from(21.0 + i as f64 / 100.0)),
                    ("Mức giá", FieldValue::from(1_000_000 * i as i64)),
                ])
            })
            .collect()
    }

    fn exporter(target: Arc<MemoryTarget>) -> RelationalExporter {
        RelationalExporter::new(target, PROPERTY_ID_FIELD).with_batch_size(2)
    }

    #[test]
    fn create_table_sql_declares_primary_key_and_types() {
        let sql = create_table_sql(
            "real_estate_properties",
            &[
                ColumnDef::new(PROPERTY_ID_FIELD, ColumnType::Text),
                ColumnDef::new("latitude", ColumnType::Double),
            ],
            Some(PROPERTY_ID_FIELD),
        );
        assert_eq!(
            sql,
            "CREATE TABLE \"real_estate_properties\" (\"propertydetails_propertyid\" TEXT PRIMARY KEY, \"latitude\" DOUBLE PRECISION)"
        );
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn batch_rows_respect_bind_limit() {
        assert_eq!(rows_per_batch(1000, 10), 1000);
        assert_eq!(rows_per_batch(100_000, 100), 655);
        assert_eq!(rows_per_batch(0, 3), 1);
        assert_eq!(rows_per_batch(10, 100_000), 1);
    }

    #[tokio::test]
    async fn export_writes_sanitized_columns_in_batches() {
        let target = Arc::new(MemoryTarget::new());
        let report = exporter(target.clone())
            .export(&records(5), "Real Estate Properties", 5)
            .await
            .expect("export");

        assert_eq!(report.table_name, "real_estate_properties");
        assert_eq!(report.rows_written, 5);
        assert_eq!(report.batches, 3);
        assert!(report.matches);
        assert_eq!(report.primary_key.as_deref(), Some(PROPERTY_ID_FIELD));

        let table = target.table("real_estate_properties").await.expect("table");
        let names: Vec<_> = table.columns.iter().map(|c| c.name.as_str()).collect();
        for original in ["Địa chỉ", "latitude", "Mức giá", PROPERTY_ID_FIELD] {
            assert!(names.contains(&sanitize(original).as_str()), "{original}");
        }
        assert_eq!(table.rows.len(), 5);
    }

    #[tokio::test]
    async fn indexes_only_on_present_columns_and_failures_are_skipped() {
        let target = Arc::new(MemoryTarget::new().failing_index_on("ia_chi"));
        let report = exporter(target.clone())
            .export(&records(2), "t", 2)
            .await
            .expect("export");

        assert_eq!(report.index_failures, vec!["ia_chi"]);
        assert_eq!(report.indexes_created, vec!["idx_t_latitude"]);
    }

    #[tokio::test]
    async fn empty_export_reports_zero_rows() {
        let target = Arc::new(MemoryTarget::new());
        let report = exporter(target.clone()).export(&[], "t", 0).await.expect("export");
        assert_eq!(report.rows_written, 0);
        assert!(report.matches);
        assert!(!report.table_created);
        assert!(target.table("t").await.is_none());
    }

    #[tokio::test]
    async fn existing_table_is_truncated_before_export() {
        let target = Arc::new(MemoryTarget::new());
        target
            .seed_table(
                "t",
                MemoryTable {
                    columns: vec![ColumnDef::new("old", ColumnType::Text)],
                    rows: vec![vec![FieldValue::from("stale")]; 4],
                    ..MemoryTable::default()
                },
            )
            .await;

        let report = exporter(target.clone()).export(&[], "t", 0).await.expect("export");
        assert!(report.truncated_existing);
        assert!(target.table("t").await.expect("table").rows.is_empty());

        let report = exporter(target.clone()).export(&records(3), "t", 3).await.expect("export");
        assert_eq!(report.rows_verified, Some(3));
    }

    #[tokio::test]
    async fn duplicate_identities_collapse_so_primary_key_holds() {
        let target = Arc::new(MemoryTarget::new());
        let mut input = records(3);
        input.push(records(1).remove(0));
        let report = exporter(target).export(&input, "t", 3).await.expect("export");
        assert_eq!(report.rows_written, 3);
        assert!(report.matches);
    }

    #[tokio::test]
    async fn table_creation_failure_aborts() {
        let target = Arc::new(MemoryTarget::new().failing_create());
        let err = exporter(target).export(&records(2), "t", 2).await.unwrap_err();
        assert!(matches!(err, ExportError::CreateTable { .. }), "{err}");
    }

    #[tokio::test]
    async fn catalog_lookup_failure_is_not_a_truncate_error() {
        let target = Arc::new(MemoryTarget::new().failing_lookup());
        let err = exporter(target.clone()).export(&records(2), "t", 2).await.unwrap_err();
        assert!(matches!(err, ExportError::Inspect { ref table, .. } if table == "t"), "{err}");
        assert!(err.to_string().starts_with("cannot inspect table t"), "{err}");
        assert!(target.table("t").await.is_none());
    }

    #[tokio::test]
    async fn failed_batch_aborts_and_reports_progress() {
        let target = Arc::new(MemoryTarget::new().failing_insert_batch(1));
        let err = exporter(target.clone()).export(&records(5), "t", 5).await.unwrap_err();
        match err {
            ExportError::BatchInsert {
                batch, rows_written, ..
            } => {
                assert_eq!(batch, 1);
                assert_eq!(rows_written, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(target.table("t").await.expect("table").rows.len(), 2);
    }

    #[tokio::test]
    async fn mismatch_against_expected_count_is_reported_not_raised() {
        let target = Arc::new(MemoryTarget::new());
        let report = exporter(target).export(&records(2), "t", 7).await.expect("export");
        assert!(!report.matches);
        assert_eq!(report.rows_expected, 7);
    }
}
