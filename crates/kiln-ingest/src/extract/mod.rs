//! Extraction from HTTP sources
//!
//! - [`ApiClient`]: single GET with bounded retry and jittered backoff
//! - [`PaginatedApiClient`]: total/limit/offset driven page loop
//! - [`ApiExtractTask`], [`FileExtractTask`]: extract stages writing to `raw/`

use thiserror::Error;

mod client;
mod paginated;
mod tasks;

pub use client::{ApiClient, ApiResponse, RetryPolicy};
pub use paginated::{
    CallStatus, PageRequest, PageSink, PaginatedApiClient, PaginatedResult, PaginationConfig,
};
pub use tasks::{ApiExtractTask, FileExtractTask};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Unexpected response shape from {url}: {reason}")]
    DataShape { url: String, reason: String },

    #[error("Source {0} has no location")]
    NoLocation(String),

    #[error(transparent)]
    Storage(#[from] crate::bucket::StorageError),
}

impl ExtractError {
    /// HTTP status attached to the error, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub(crate) fn shape(url: &str, reason: impl Into<String>) -> Self {
        Self::DataShape {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}
