//! Shared fixtures for kiln-ingest integration tests

#![allow(dead_code)]

use kiln_ingest::bucket::BucketStore;
use kiln_ingest::catalog::SourceConfig;
use kiln_ingest::config::HttpConfig;
use kiln_ingest::context::RunContext;
use kiln_ingest::extract::{ApiClient, RetryPolicy};
use kiln_ingest::metrics::{HostInfo, ResourceSample, ScriptedSampler};
use kiln_ingest::warehouse::MemoryWarehouse;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

pub fn host() -> HostInfo {
    HostInfo {
        host_name: "test-host".to_string(),
        execution_user: "kiln".to_string(),
        process_id: 4242,
    }
}

/// Context over a local bucket at `root` and an in-memory warehouse.
pub fn context(root: &Path, warehouse: Arc<MemoryWarehouse>) -> RunContext {
    RunContext::new(
        BucketStore::local(root),
        warehouse.clone(),
        warehouse,
        Arc::new(ScriptedSampler::constant(ResourceSample::new(12.5, 256.0))),
        host(),
    )
}

/// HTTP client that gives up after the first failed attempt.
pub fn client() -> ApiClient {
    ApiClient::new(&HttpConfig::default())
        .unwrap()
        .with_retry(RetryPolicy::none())
}

pub fn api_source(pipeline: &str, code: &str, location: &str, params: Value) -> SourceConfig {
    serde_json::from_value(json!({
        "source_code": code,
        "source_name": code,
        "location_type": "API",
        "location": location,
        "extract_type": "json",
        "params": params,
        "pipeline_code": pipeline
    }))
    .unwrap()
}

pub fn numbered(range: std::ops::Range<u64>) -> Vec<Value> {
    range.map(|i| json!({"id": i, "label": format!("item-{i}")})).collect()
}
