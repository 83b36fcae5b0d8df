//! Incremental consolidation: change detection, dedup, versioned merge, relational export.

mod dedup;
mod error;
mod export;
mod fingerprint;
mod pipeline;
mod snapshot;
mod versioned;

pub use dedup::{DedupReport, Deduplicator};
pub use error::{ExportError, MergeError};
pub use export::{
    create_index_sql, create_table_sql, index_name, quote_ident, rows_per_batch, ExportReport,
    MemoryTable, MemoryTarget, PgTarget, RelationalExporter, RelationalTarget,
    DEFAULT_INDEX_COLUMNS, MAX_BIND_PARAMS,
};
pub use fingerprint::{fingerprint, ChangeSet, ChangeSetSummary, FingerprintComparator, FingerprintIndex};
pub use pipeline::{
    criteria_from_workspace, load_search_criteria, pipeline_from_config,
    BranchReport, Pipeline, PipelineConfig, PipelineReport, SearchCriteriaFile, SEARCH_CRITERIA_FILE,
};
pub use snapshot::{decode_snapshot, encode_snapshot};
pub use versioned::{
    CommitEntry, CommitOperation, MergeOutcome, SchemaDriftPolicy, StoreSnapshot, VersionedStore,
    VersionedStoreMerger,
};

pub const CRATE_NAME: &str = "estate-sync";
