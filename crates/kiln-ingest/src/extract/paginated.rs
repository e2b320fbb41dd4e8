use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{ApiClient, ExtractError};
use crate::bucket::{BlobKey, BucketStore, WriteMode};

/// Names of the fields and query parameters that drive pagination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Response field holding the total record count
    pub total_field: String,
    /// Response field holding the page's records
    pub results_field: String,
    /// Optional field inside `results_field` that holds the records
    #[serde(default)]
    pub sub_results_field: Option<String>,
    /// Query parameter carrying the page size; no paging when absent
    #[serde(default)]
    pub limit_param: Option<String>,
    /// Query parameter carrying the record offset
    #[serde(default)]
    pub offset_param: Option<String>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            total_field: "total_count".to_string(),
            results_field: "results".to_string(),
            sub_results_field: None,
            limit_param: Some("limit".to_string()),
            offset_param: Some("offset".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub params: Map<String, Value>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub pagination: PaginationConfig,
}

impl PageRequest {
    pub fn new(url: impl Into<String>, pagination: PaginationConfig) -> Self {
        Self {
            url: url.into(),
            params: Map::new(),
            headers: BTreeMap::new(),
            timeout: None,
            pagination,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Bucket object that receives each page as it arrives
#[derive(Clone, Copy)]
pub struct PageSink<'a> {
    pub bucket: &'a BucketStore,
    pub key: &'a BlobKey,
}

/// HTTP status of one page call; `None` when no response arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatus {
    pub call: usize,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct PaginatedResult {
    pub records: Vec<Value>,
    pub calls: Vec<CallStatus>,
    /// Total declared by the server in the probe response
    pub total_records: u64,
}

impl PaginatedResult {
    /// True when the pages delivered exactly the declared total.
    pub fn consistency_check(&self) -> bool {
        self.records.len() as u64 == self.total_records
    }

    /// Status of the last page call that got a response.
    pub fn last_status(&self) -> Option<u16> {
        self.calls.iter().rev().find_map(|c| c.status)
    }
}

#[derive(Clone)]
pub struct PaginatedApiClient {
    client: ApiClient,
}

impl PaginatedApiClient {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Fetch every page of `request`.
    ///
    /// A probe call reads the declared total. With a limit parameter the
    /// total is split into `ceil(total / limit)` pages, each requested with
    /// `offset = page * limit`; otherwise one page is requested. A page that
    /// fails after retries is logged and contributes no records. When `sink`
    /// is given, the first page that arrives overwrites the object and later
    /// pages are appended; if no page arrives the object is replaced with an
    /// empty artifact.
    #[instrument(skip(self, request, sink), fields(url = %request.url))]
    pub async fn fetch_all(
        &self,
        request: &PageRequest,
        sink: Option<PageSink<'_>>,
    ) -> Result<PaginatedResult, ExtractError> {
        let url = request.url.as_str();
        let cfg = &request.pagination;

        let probe = self
            .client
            .get_json(url, &request.params, &request.headers, request.timeout)
            .await?;
        let total = read_total(url, &probe.body, cfg)?;

        let limit = match &cfg.limit_param {
            Some(limit_param) => Some(read_limit(url, &request.params, limit_param)?),
            None => None,
        };
        let pages = limit.map_or(1, |l| total.div_ceil(l));

        info!(total, pages, "Starting paginated extraction");

        let mut result = PaginatedResult {
            total_records: total,
            ..PaginatedResult::default()
        };
        let mut first_write = true;

        for page in 0..pages {
            let mut params = request.params.clone();
            if let (Some(offset_param), Some(limit)) = (&cfg.offset_param, limit) {
                params.insert(offset_param.clone(), Value::from(page * limit));
            }

            let call = page as usize;
            let response = match self
                .client
                .get_json(url, &params, &request.headers, request.timeout)
                .await
            {
                Ok(response) => response,
                Err(e @ ExtractError::DataShape { .. }) => return Err(e),
                Err(e) => {
                    warn!(page = call, error = %e, "Page failed; continuing");
                    result.calls.push(CallStatus {
                        call,
                        status: e.status(),
                    });
                    continue;
                },
            };
            result.calls.push(CallStatus {
                call,
                status: Some(response.status),
            });

            let records = read_results(url, response.body, cfg)?;
            debug!(page = call, records = records.len(), "Page received");

            if let Some(sink) = sink {
                let mode = if first_write {
                    WriteMode::Overwrite
                } else {
                    WriteMode::Append
                };
                sink.bucket.write(&records, sink.key, mode).await?;
                first_write = false;
            }
            result.records.extend(records);
        }

        if let Some(sink) = sink.filter(|_| first_write) {
            sink.bucket
                .write::<Value>(&[], sink.key, WriteMode::Overwrite)
                .await?;
        }

        if !result.consistency_check() {
            warn!(
                expected = result.total_records,
                received = result.records.len(),
                "Record count does not match declared total"
            );
        }

        Ok(result)
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Total from the top level, or nested under the results field.
fn read_total(url: &str, body: &Value, cfg: &PaginationConfig) -> Result<u64, ExtractError> {
    body.get(&cfg.total_field)
        .or_else(|| body.get(&cfg.results_field)?.get(&cfg.total_field))
        .and_then(as_count)
        .ok_or_else(|| {
            ExtractError::shape(url, format!("missing or invalid total field '{}'", cfg.total_field))
        })
}

fn read_limit(url: &str, params: &Map<String, Value>, name: &str) -> Result<u64, ExtractError> {
    params
        .get(name)
        .and_then(as_count)
        .filter(|l| *l > 0)
        .ok_or_else(|| ExtractError::shape(url, format!("limit parameter '{name}' must be a positive integer")))
}

fn read_results(url: &str, body: Value, cfg: &PaginationConfig) -> Result<Vec<Value>, ExtractError> {
    let Value::Object(mut body) = body else {
        return Err(ExtractError::shape(url, "response is not an object"));
    };
    let mut results = body
        .remove(&cfg.results_field)
        .ok_or_else(|| ExtractError::shape(url, format!("missing results field '{}'", cfg.results_field)))?;

    if let Some(sub) = &cfg.sub_results_field {
        results = match results {
            Value::Object(mut inner) => inner.remove(sub).ok_or_else(|| {
                ExtractError::shape(url, format!("missing sub-results field '{sub}'"))
            })?,
            _ => return Err(ExtractError::shape(url, "results field is not an object")),
        };
    }

    match results {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        _ => Err(ExtractError::shape(url, "results are not an array")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_total_top_level_or_nested() {
        let cfg = PaginationConfig::default();
        assert_eq!(read_total("u", &json!({"total_count": 25}), &cfg).unwrap(), 25);
        assert_eq!(
            read_total("u", &json!({"results": {"total_count": "7"}}), &cfg).unwrap(),
            7
        );
        assert!(read_total("u", &json!({"count": 1}), &cfg).is_err());
    }

    #[test]
    fn test_results_with_sub_field() {
        let cfg = PaginationConfig {
            sub_results_field: Some("items".to_string()),
            ..PaginationConfig::default()
        };
        let records = read_results("u", json!({"results": {"items": [{"a": 1}]}}), &cfg).unwrap();
        assert_eq!(records, vec![json!({"a": 1})]);
        assert!(read_results("u", json!({"results": [1]}), &cfg).is_err());
    }

    #[test]
    fn test_limit_must_be_positive() {
        let mut params = Map::new();
        params.insert("limit".to_string(), json!(0));
        assert!(read_limit("u", &params, "limit").is_err());
        params.insert("limit".to_string(), json!("10"));
        assert_eq!(read_limit("u", &params, "limit").unwrap(), 10);
    }

    #[test]
    fn test_consistency_and_last_status() {
        let result = PaginatedResult {
            records: vec![json!({}); 3],
            calls: vec![
                CallStatus { call: 0, status: Some(200) },
                CallStatus { call: 1, status: None },
            ],
            total_records: 3,
        };
        assert!(result.consistency_check());
        assert_eq!(result.last_status(), Some(200));
    }
}
