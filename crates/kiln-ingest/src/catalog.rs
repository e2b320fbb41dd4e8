//! Pipeline source catalog
//!
//! Sources live in `operations.source`. Each names where data comes from
//! (`API` or `FILE`), how to call it, and which pipeline owns it. The catalog
//! also answers "where is the latest finished artifact of this source", which
//! transform stages use to locate their input.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::extract::PaginationConfig;
use crate::task::{Status, TaskType};
use crate::warehouse::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LocationType {
    Api,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_code: String,
    pub source_name: String,
    pub location_type: LocationType,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub location_endpoint: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    pub extract_type: String,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
    #[serde(default)]
    pub headers: Option<Map<String, Value>>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    pub pipeline_code: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SourceConfig {
    /// `location` joined with `location_endpoint`, if any.
    pub fn url(&self) -> Option<String> {
        let base = self.location.as_deref()?.trim();
        if base.is_empty() {
            return None;
        }
        Some(match self.location_endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            ),
            _ => base.to_string(),
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn params(&self) -> Map<String, Value> {
        self.params.clone().unwrap_or_default()
    }

    /// Header values as strings; non-string JSON values are rendered as JSON.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .flatten()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// Artifact name shared by a source's extract, transform and load stages.
    pub fn artifact_name(&self) -> String {
        format!("{}_{}", self.pipeline_code, self.source_code)
    }
}

#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Active sources of `pipeline_code`, ordered by source code.
    async fn active_sources(&self, pipeline_code: &str) -> Result<Vec<SourceConfig>>;

    /// `task_image` of the most recently ended task matching all three filters.
    async fn latest_artifact(
        &self,
        source_code: &str,
        task_type: TaskType,
        status: Status,
    ) -> Result<Option<String>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> SourceConfig {
        serde_json::from_value(json!({
            "source_code": "src1",
            "source_name": "ISO countries",
            "location_type": "API",
            "location": "https://api.example.org/",
            "location_endpoint": "/v1/countries",
            "extract_type": "json",
            "headers": {"Accept": "application/json", "X-Page": 3},
            "timeout": 12.5,
            "pipeline_code": "geo",
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_deserialize_row_with_defaults() {
        let s = source();
        assert!(s.active);
        assert_eq!(s.location_type, LocationType::Api);
        assert!(s.pagination.is_none());
        assert!(s.params().is_empty());
    }

    #[test]
    fn test_url_joins_endpoint() {
        assert_eq!(
            source().url().as_deref(),
            Some("https://api.example.org/v1/countries")
        );
        let mut s = source();
        s.location_endpoint = None;
        assert_eq!(s.url().as_deref(), Some("https://api.example.org/"));
        s.location = None;
        assert!(s.url().is_none());
    }

    #[test]
    fn test_headers_and_timeout() {
        let s = source();
        let headers = s.headers();
        assert_eq!(headers["Accept"], "application/json");
        assert_eq!(headers["X-Page"], "3");
        assert_eq!(s.timeout(), Some(Duration::from_millis(12_500)));
        assert_eq!(s.artifact_name(), "geo_src1");
    }
}
