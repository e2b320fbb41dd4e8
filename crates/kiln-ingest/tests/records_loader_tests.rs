//! Records loader against the in-memory warehouse

use kiln_ingest::loader::RecordsLoader;
use kiln_ingest::schema::TableSchema;
use kiln_ingest::warehouse::{MemoryWarehouse, Operation};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn apps() -> TableSchema {
    TableSchema::new("reference", "app", "app_code").with_columns(["app_code", "app_name"])
}

#[tokio::test]
async fn test_record_with_unknown_key_is_inserted() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let loader = RecordsLoader::new(warehouse.clone());
    let table = TableSchema::new("reference", "thing", "id");

    let summary = loader
        .upsert(&table, vec![json!({"id": 9999, "name": "restored"})], Some(Uuid::new_v4()))
        .await
        .unwrap();

    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.logged, 1);
    let row = warehouse.row(&table, "9999").await.unwrap();
    assert_eq!(row["name"], "restored");

    let audit = warehouse.audit_log().await;
    assert_eq!(audit[0].operation, Operation::Create);
    assert!(audit[0].previous_value.is_none());
}

#[tokio::test]
async fn test_reloading_same_batch_logs_nothing() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let loader = RecordsLoader::new(warehouse.clone());
    let table = apps();
    let batch = vec![
        json!({"app_code": "abc", "app_name": "Alpha"}),
        json!({"app_code": "def", "app_name": "Delta"}),
    ];

    let first = loader
        .upsert(&table, batch.clone(), Some(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(first.inserted, 2);

    let second = loader.upsert(&table, batch, Some(Uuid::new_v4())).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.logged, 0);

    let updates = warehouse
        .audit_log()
        .await
        .into_iter()
        .filter(|e| e.operation == Operation::Update)
        .count();
    assert_eq!(updates, 0);
}

#[tokio::test]
async fn test_update_audits_only_changed_fields() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let table = apps();
    warehouse
        .seed(&table, vec![json!({"app_code": "abc", "app_name": "Old"})])
        .await;
    let loader = RecordsLoader::new(warehouse.clone());
    let task_id = Uuid::new_v4();

    let summary = loader
        .upsert(
            &table,
            vec![json!({"app_code": "abc", "app_name": "New"})],
            Some(task_id),
        )
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.logged, 1);

    let audit = warehouse.audit_log().await;
    assert_eq!(audit.len(), 1);
    let entry = &audit[0];
    assert_eq!(entry.operation, Operation::Update);
    assert_eq!(entry.record_id, "abc");
    assert_eq!(entry.task_id, task_id);
    assert_eq!(entry.previous_value, Some(json!({"app_name": "Old"})));
    assert_eq!(entry.new_value, json!({"app_name": "New"}));

    let row = warehouse.row(&table, "abc").await.unwrap();
    assert_eq!(row["app_name"], "New");
}

#[tokio::test]
async fn test_failed_apply_leaves_table_untouched() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let table = apps();
    warehouse
        .seed(&table, vec![json!({"app_code": "abc", "app_name": "Old"})])
        .await;
    let loader = RecordsLoader::new(warehouse.clone());

    warehouse.fail_next_apply();
    let result = loader
        .upsert(
            &table,
            vec![
                json!({"app_code": "abc", "app_name": "New"}),
                json!({"app_code": "xyz", "app_name": "Extra"}),
            ],
            Some(Uuid::new_v4()),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(warehouse.rows(&table).await.len(), 1);
    assert_eq!(warehouse.row(&table, "abc").await.unwrap()["app_name"], "Old");
    assert!(warehouse.audit_log().await.is_empty());
}

#[tokio::test]
async fn test_derived_keys_are_stable() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let loader = RecordsLoader::new(warehouse.clone());
    let table = TableSchema::app();

    loader
        .upsert(&table, vec![json!({"app_name": "Ministry of Labour"})], None)
        .await
        .unwrap();
    let again = loader
        .upsert(&table, vec![json!({"app_name": "Ministry of Labour"})], None)
        .await
        .unwrap();

    assert_eq!(again.inserted, 0);
    let rows = warehouse.rows(&table).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["app_code"].as_str().unwrap().len(), 8);
}
