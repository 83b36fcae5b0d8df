use arrow_schema::ArrowError;
use estate_core::ColumnType;
use estate_storage::StorageError;
use parquet::errors::ParquetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cannot encode column {column} at row {row}: expected {expected:?}, found {found}")]
    Encode {
        column: String,
        row: usize,
        expected: ColumnType,
        found: String,
    },
    #[error("snapshot has no columns")]
    EmptySchema,
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("cannot decode snapshot: {0}")]
    Decode(String),
    #[error("corrupt commit log entry {key}: {source}")]
    CorruptLog {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("commit {version} references missing data file {key}")]
    MissingDataFile { version: u64, key: String },
    #[error("snapshot {key} of commit {version} does not match its checksum")]
    ChecksumMismatch { version: u64, key: String },
    #[error("commit {0} already exists; another merge is in flight")]
    Conflict(u64),
    #[error("cannot serialize commit entry: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot connect to relational store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("cannot inspect table {table}: {source}")]
    Inspect {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("cannot truncate {table}: {source}")]
    Truncate {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("cannot create table {table}: {source}")]
    CreateTable {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("insert batch {batch} into {table} failed after {rows_written} rows: {source}")]
    BatchInsert {
        table: String,
        batch: usize,
        rows_written: u64,
        #[source]
        source: sqlx::Error,
    },
}
