//! Staging bucket for extracted and transformed artifacts
//!
//! Artifacts are gzip-compressed, one JSON document per line. Append mode adds
//! a new gzip member to the end of the object, so a run that dies part way
//! leaves a readable file holding every record written before the crash.
//! Readers decode all members and also accept a single JSON array document.
//!
//! Layout:
//!
//! ```text
//! raw/{job_id}/{name}.json.gz           extracted records
//! raw/{job_id}/{name}.bin.gz            extracted files (raw bytes)
//! transformed/{job_id}/{name}.json.gz   transformed records
//! jobs/J_{job_id}.json.gz               job statistics
//! jobs/T_{job_id}.json.gz               task statistics
//! ```

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

mod local;
mod s3;

pub use local::LocalBackend;
pub use s3::S3Backend;

use crate::config::BucketConfig;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Malformed record in {key} line {line}: {source}")]
    Malformed {
        key: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object store error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace any existing object
    Overwrite,
    /// Add to the end of the object, creating it when missing
    Append,
}

/// Where a job's stats snapshot is mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Job,
    Task,
}

impl StatsKind {
    fn prefix(self) -> &'static str {
        match self {
            StatsKind::Job => "J",
            StatsKind::Task => "T",
        }
    }
}

/// Relative path of an object inside the bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

impl BlobKey {
    /// Validate an arbitrary relative path.
    pub fn parse(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let trimmed = path.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('/')
            || trimmed.ends_with('/')
            || trimmed.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(StorageError::InvalidKey(path));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn raw(job_id: Uuid, name: &str) -> Result<Self> {
        Ok(Self(format!("raw/{job_id}/{}.json.gz", segment(name)?)))
    }

    pub fn raw_file(job_id: Uuid, name: &str) -> Result<Self> {
        Ok(Self(format!("raw/{job_id}/{}.bin.gz", segment(name)?)))
    }

    pub fn transformed(job_id: Uuid, name: &str) -> Result<Self> {
        Ok(Self(format!("transformed/{job_id}/{}.json.gz", segment(name)?)))
    }

    pub fn stats(kind: StatsKind, job_id: Uuid) -> Self {
        Self(format!("jobs/{}_{job_id}.json.gz", kind.prefix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single path segment: non-empty, no separator, not `.` or `..`.
fn segment(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    Ok(name)
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte-level object store
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> Result<()>;

    /// Append `bytes` to the object, creating it if missing.
    async fn append(&self, key: &BlobKey, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>>;

    async fn exists(&self, key: &BlobKey) -> Result<bool>;

    /// Human-readable location of `key`, used for logs and task images.
    fn locate(&self, key: &BlobKey) -> String;
}

#[derive(Clone)]
pub struct BucketStore {
    backend: Arc<dyn BlobBackend>,
}

impl BucketStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self { backend }
    }

    pub fn local(root: impl Into<std::path::PathBuf>) -> Self {
        Self::new(Arc::new(LocalBackend::new(root)))
    }

    pub async fn from_config(config: &BucketConfig) -> Result<Self> {
        match config {
            BucketConfig::Local { root } => Ok(Self::local(root.clone())),
            BucketConfig::S3(s3) => Ok(Self::new(Arc::new(S3Backend::new(s3).await?))),
        }
    }

    pub fn locate(&self, key: &BlobKey) -> String {
        self.backend.locate(key)
    }

    /// Write `records` as gzip-compressed JSON lines. Returns the record count.
    #[instrument(skip(self, records), fields(key = %key))]
    pub async fn write<T: Serialize>(
        &self,
        records: &[T],
        key: &BlobKey,
        mode: WriteMode,
    ) -> Result<usize> {
        let bytes = encode_lines(records)?;
        match mode {
            WriteMode::Overwrite => self.backend.put(key, bytes).await?,
            WriteMode::Append => self.backend.append(key, bytes).await?,
        }
        debug!(records = records.len(), ?mode, "Wrote records");
        Ok(records.len())
    }

    /// Read every record of a JSON artifact.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn read(&self, key: &BlobKey) -> Result<Vec<Value>> {
        let bytes = self.backend.get(key).await?;
        let text = decompress(key, &bytes)?;
        let records = decode_records(key, &text)?;
        debug!(records = records.len(), "Read records");
        Ok(records)
    }

    /// Store raw bytes gzip-compressed.
    #[instrument(skip(self, bytes), fields(key = %key, size = bytes.len()))]
    pub async fn write_bytes(&self, bytes: &[u8], key: &BlobKey) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| StorageError::io(key, e))?;
        let compressed = encoder.finish().map_err(|e| StorageError::io(key, e))?;
        self.backend.put(key, compressed).await
    }

    pub async fn read_bytes(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let bytes = self.backend.get(key).await?;
        let mut out = Vec::new();
        MultiGzDecoder::new(bytes.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| StorageError::io(key, e))?;
        Ok(out)
    }

    pub async fn exists(&self, key: &BlobKey) -> Result<bool> {
        self.backend.exists(key).await
    }
}

fn encode_lines<T: Serialize>(records: &[T]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for record in records {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        encoder
            .write_all(&line)
            .map_err(|e| StorageError::io("<buffer>", e))?;
    }
    encoder.finish().map_err(|e| StorageError::io("<buffer>", e))
}

fn decompress(key: &BlobKey, bytes: &[u8]) -> Result<String> {
    let mut text = String::new();
    MultiGzDecoder::new(bytes)
        .read_to_string(&mut text)
        .map_err(|e| StorageError::io(key, e))?;
    Ok(text)
}

fn decode_records(key: &BlobKey, text: &str) -> Result<Vec<Value>> {
    if text.trim_start().starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
            return Ok(items);
        }
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| StorageError::Malformed {
                key: key.to_string(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}
