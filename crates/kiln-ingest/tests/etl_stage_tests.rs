//! Extract, transform and load of one paginated source end to end

mod common;

use kiln_ingest::bucket::BlobKey;
use kiln_ingest::extract::PaginationConfig;
use kiln_ingest::pipeline::{EtlPipeline, PipelineRegistry};
use kiln_ingest::schema::TableSchema;
use kiln_ingest::stages::FieldMapping;
use kiln_ingest::task::{Status, TaskType};
use kiln_ingest::warehouse::{MemoryWarehouse, Operation};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn countries(range: std::ops::Range<usize>) -> Vec<Value> {
    let all = [
        ("AD", "Andorra"),
        ("BE", "Belgium"),
        ("CL", "Chile"),
        ("DK", "Denmark"),
        ("EG", "Egypt"),
    ];
    all[range]
        .iter()
        .map(|(code, name)| json!({"iso2": code, "label_en": name, "geo_shape": null}))
        .collect()
}

async fn serve_countries(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/countries"))
        .and(query_param_is_missing("offset"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_count": 5,
            "results": []
        })))
        .mount(server)
        .await;
    for (offset, range) in [(0, 0..2), (2, 2..4), (4, 4..5)] {
        Mock::given(method("GET"))
            .and(path("/countries"))
            .and(query_param("offset", offset.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_count": 5,
                "results": countries(range)
            })))
            .mount(server)
            .await;
    }
}

fn country_table() -> TableSchema {
    TableSchema::new("geo", "country", "country_code").with_columns(["country_code", "name"])
}

fn registry() -> PipelineRegistry {
    PipelineRegistry::new().register(
        "geo",
        Arc::new(EtlPipeline::new(
            common::client(),
            Some(PaginationConfig::default()),
            Arc::new(
                FieldMapping::new()
                    .rename("iso2", "country_code")
                    .rename("label_en", "name")
                    .keep(["country_code", "name"]),
            ),
            country_table(),
        )),
    )
}

#[tokio::test]
async fn test_source_lands_in_table_with_audit() {
    let server = MockServer::start().await;
    serve_countries(&server).await;

    let dir = TempDir::new().unwrap();
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse
        .add_source(common::api_source(
            "geo",
            "iso3166",
            &format!("{}/countries", server.uri()),
            json!({"limit": 2}),
        ))
        .await;
    let ctx = common::context(dir.path(), warehouse.clone());

    let mut job = registry()
        .build_job("geo", "kiln", warehouse.as_ref())
        .await
        .unwrap();
    let job_id = job.id();
    let report = job.run_job(&ctx).await;

    assert_eq!(report.job.status, Status::Finished);
    assert_eq!(report.failed_tasks(), 0, "tasks: {:?}", report.tasks);

    let extract = &report.tasks[0];
    assert_eq!(extract.task_type_code, TaskType::Extract);
    assert_eq!(extract.records_processed, 5);
    assert_eq!(extract.location_status, Some(200));
    assert_eq!(
        extract.task_image.as_deref(),
        Some(BlobKey::raw(job_id, "geo_iso3166").unwrap().as_str())
    );

    let transform = &report.tasks[1];
    let transformed = ctx
        .bucket
        .read(&BlobKey::transformed(job_id, "geo_iso3166").unwrap())
        .await
        .unwrap();
    assert_eq!(transformed.len(), 5);
    assert_eq!(transformed[0], json!({"country_code": "AD", "name": "Andorra"}));
    assert_eq!(transform.records_processed, 5);

    let load = &report.tasks[2];
    assert_eq!(load.task_image.as_deref(), Some("geo.country"));
    assert_eq!(load.records_processed, 5);

    let rows = warehouse.rows(&country_table()).await;
    assert_eq!(rows.len(), 5);
    let chile = warehouse.row(&country_table(), "CL").await.unwrap();
    assert_eq!(chile["name"], "Chile");
    assert_eq!(
        chile["lineage_metadata"]["created_in_task"],
        json!(load.task_id)
    );

    let audit = warehouse.audit_log().await;
    assert_eq!(audit.len(), 5);
    assert!(audit
        .iter()
        .all(|e| e.operation == Operation::Create && e.task_id == load.task_id));
}

#[tokio::test]
async fn test_rerun_updates_nothing() {
    let server = MockServer::start().await;
    serve_countries(&server).await;

    let dir = TempDir::new().unwrap();
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse
        .add_source(common::api_source(
            "geo",
            "iso3166",
            &format!("{}/countries", server.uri()),
            json!({"limit": 2}),
        ))
        .await;
    let ctx = common::context(dir.path(), warehouse.clone());

    for _ in 0..2 {
        let mut job = registry()
            .build_job("geo", "kiln", warehouse.as_ref())
            .await
            .unwrap();
        let report = job.run_job(&ctx).await;
        assert_eq!(report.failed_tasks(), 0);
    }

    assert_eq!(warehouse.rows(&country_table()).await.len(), 5);
    let updates = warehouse
        .audit_log()
        .await
        .into_iter()
        .filter(|e| e.operation == Operation::Update)
        .count();
    assert_eq!(updates, 0);
}

#[tokio::test]
async fn test_extract_failure_fails_downstream_stages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/countries"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse
        .add_source(common::api_source(
            "geo",
            "iso3166",
            &format!("{}/countries", server.uri()),
            json!({"limit": 2}),
        ))
        .await;
    let ctx = common::context(dir.path(), warehouse.clone());

    let mut job = registry()
        .build_job("geo", "kiln", warehouse.as_ref())
        .await
        .unwrap();
    let report = job.run_job(&ctx).await;

    assert_eq!(report.job.status, Status::Finished);
    assert_eq!(report.failed_tasks(), 3);
    assert!(warehouse.rows(&country_table()).await.is_empty());
}

#[tokio::test]
async fn test_unpaginated_source_uses_single_get() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"role_id": "admin", "title": "Administrator"},
            {"role_id": "viewer", "title": "Viewer"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse
        .add_source(common::api_source(
            "auth",
            "roles",
            &format!("{}/roles", server.uri()),
            Value::Null,
        ))
        .await;
    let ctx = common::context(dir.path(), warehouse.clone());

    let roles = TableSchema::new("auth", "role", "role_id");
    let registry = PipelineRegistry::new().register(
        "auth",
        Arc::new(EtlPipeline::new(
            common::client(),
            None,
            Arc::new(FieldMapping::new()),
            roles.clone(),
        )),
    );

    let mut job = registry
        .build_job("auth", "kiln", warehouse.as_ref())
        .await
        .unwrap();
    let report = job.run_job(&ctx).await;

    assert_eq!(report.failed_tasks(), 0, "tasks: {:?}", report.tasks);
    assert_eq!(report.tasks[0].records_processed, 2);
    assert_eq!(warehouse.rows(&roles).await.len(), 2);
    assert_eq!(
        warehouse.row(&roles, "viewer").await.unwrap()["title"],
        "Viewer"
    );
}
