use std::path::PathBuf;
use std::sync::Arc;

use estate_adapters::FixtureExtractor;
use estate_core::{sanitize, FieldValue, NORMALIZED_PRICE_FIELD, PROPERTY_ID_FIELD};
use estate_storage::LocalObjectStore;
use estate_sync::{
    load_search_criteria, CommitOperation, MemoryTarget, Pipeline, PipelineConfig, VersionedStore,
    SEARCH_CRITERIA_FILE,
};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn pipeline(store_root: &std::path::Path, target: Arc<MemoryTarget>) -> Pipeline {
    let root = workspace_root();
    let config = PipelineConfig {
        local_store_root: Some(store_root.to_path_buf()),
        fixtures_dir: root.join("fixtures"),
        workspace_root: root,
        ..PipelineConfig::default()
    };
    let extractor = Arc::new(FixtureExtractor::new(config.fixtures_dir.clone(), config.limit_each_page));
    let store = VersionedStore::new(
        Arc::new(LocalObjectStore::new(store_root)),
        config.table_prefix.clone(),
    );
    Pipeline::new(config, extractor, store, target)
}

#[tokio::test]
async fn fixture_run_is_idempotent_across_invocations() {
    let criteria = load_search_criteria(workspace_root().join(SEARCH_CRITERIA_FILE)).expect("criteria");
    let dir = tempdir().expect("tempdir");
    let target = Arc::new(MemoryTarget::new());
    let pipeline = pipeline(dir.path(), target.clone());

    let first = pipeline.run(&criteria).await;
    assert!(first.success, "{}", first.message);
    assert_eq!(first.branches.len(), 2);
    assert!(first.branches.iter().all(|b| b.error.is_none()));
    assert_eq!(first.record_count, 4);
    let merge = first.merge.as_ref().expect("merge ran");
    assert_eq!(merge.operation, Some(CommitOperation::Create));

    let table = target.table("real_estate_properties").await.expect("table");
    assert_eq!(table.rows.len(), 4);
    let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    for original in ["Địa chỉ", "Mức giá", "Diện tích", "latitude", "search_city"] {
        assert!(names.contains(&sanitize(original).as_str()), "missing {original}: {names:?}");
    }
    assert!(!names.contains(&"factid"));
    assert!(table.indexes.iter().any(|i| i.ends_with("_ia_chi")));

    let second = pipeline.run(&criteria).await;
    assert!(second.success, "{}", second.message);
    assert!(second.merge.is_none());
    assert_eq!(second.change_set.map(|c| c.unchanged), Some(4));
    assert_eq!(target.table("real_estate_properties").await.expect("table").rows.len(), 4);
    assert_eq!(pipeline.store().history().await.expect("history").len(), 1);
}

#[tokio::test]
async fn fixture_records_carry_identity_and_price() {
    let criteria = load_search_criteria(workspace_root().join(SEARCH_CRITERIA_FILE)).expect("criteria");
    let dir = tempdir().expect("tempdir");
    let pipeline = pipeline(dir.path(), Arc::new(MemoryTarget::new()));

    let report = pipeline.run(&criteria).await;
    assert!(report.success, "{}", report.message);

    let snapshot = pipeline.store().load().await.expect("load").expect("store exists");
    let find = |id: &str| {
        snapshot
            .records
            .iter()
            .find(|r| r.text(PROPERTY_ID_FIELD).as_deref() == Some(id))
            .unwrap_or_else(|| panic!("record {id} missing"))
    };

    let khuong_trung = find("778899");
    assert_eq!(
        khuong_trung.get(NORMALIZED_PRICE_FIELD),
        Some(&FieldValue::Integer(4_500_000_000))
    );
    assert_eq!(khuong_trung.get("latitude"), Some(&FieldValue::Float(20.995)));

    let negotiable = find("778900");
    assert_eq!(negotiable.text("muc_gia").as_deref(), Some("Thỏa thuận"));
    assert_eq!(negotiable.get(NORMALIZED_PRICE_FIELD), Some(&FieldValue::Null));

    let son_tra = find("dn-1001");
    assert_eq!(
        son_tra.get(NORMALIZED_PRICE_FIELD),
        Some(&FieldValue::Integer(3_200_000_000))
    );
    assert_eq!(son_tra.text("search_city").as_deref(), Some("da-nang"));
}
