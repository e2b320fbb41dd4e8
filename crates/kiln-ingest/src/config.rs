//! Engine configuration
//!
//! Loaded once at startup from the process environment (after reading an
//! optional `.env` file) and passed down explicitly. Nothing below the binary
//! reads environment variables on its own.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/kiln";

/// Default maximum database connections in the pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default root directory of the local bucket.
pub const DEFAULT_BUCKET_PATH: &str = "./bucket";

/// Default S3 bucket name.
pub const DEFAULT_S3_BUCKET: &str = "kiln-data";

/// Default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default per-request HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default number of attempts for a single HTTP call (first try included).
pub const DEFAULT_HTTP_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff in milliseconds.
pub const DEFAULT_HTTP_BACKOFF_MS: u64 = 500;

/// Default application code stamped on jobs.
pub const DEFAULT_APP_CODE: &str = "kiln";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilnConfig {
    pub app_code: String,
    pub database: DatabaseConfig,
    pub bucket: BucketConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Which blob backend holds staged artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BucketConfig {
    Local { root: PathBuf },
    S3(S3Config),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl S3Config {
    /// Settings for a local MinIO instance with default credentials.
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    fn from_env() -> Self {
        Self {
            endpoint: env_string("S3_ENDPOINT"),
            region: env_string("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            bucket: env_string("S3_BUCKET").unwrap_or_else(|| DEFAULT_S3_BUCKET.to_string()),
            access_key: env_string("S3_ACCESS_KEY")
                .or_else(|| env_string("AWS_ACCESS_KEY_ID"))
                .unwrap_or_default(),
            secret_key: env_string("S3_SECRET_KEY")
                .or_else(|| env_string("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_default(),
            path_style: env_parse("S3_PATH_STYLE").unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            max_attempts: DEFAULT_HTTP_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_HTTP_BACKOFF_MS,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl KilnConfig {
    /// Load configuration from `.env` and the environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let bucket = match env_string("KILN_BUCKET_BACKEND").as_deref() {
            None | Some("local") => BucketConfig::Local {
                root: env_string("KILN_BUCKET_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_BUCKET_PATH)),
            },
            Some("s3") => BucketConfig::S3(S3Config::from_env()),
            Some(other) => anyhow::bail!("Unknown bucket backend '{}' (expected local or s3)", other),
        };

        let config = KilnConfig {
            app_code: env_string("KILN_APP_CODE").unwrap_or_else(|| DEFAULT_APP_CODE.to_string()),
            database: DatabaseConfig {
                url: env_string("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parse("DB_MAX_CONNECTIONS")
                    .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
                min_connections: env_parse("DB_MIN_CONNECTIONS")
                    .unwrap_or(DEFAULT_DB_MIN_CONNECTIONS),
                connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT")
                    .unwrap_or(DEFAULT_DB_CONNECT_TIMEOUT_SECS),
            },
            bucket,
            http: HttpConfig {
                timeout_secs: env_parse("KILN_HTTP_TIMEOUT").unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
                max_attempts: env_parse("KILN_HTTP_MAX_RETRIES")
                    .unwrap_or(DEFAULT_HTTP_MAX_ATTEMPTS),
                backoff_base_ms: env_parse("KILN_HTTP_BACKOFF_MS")
                    .unwrap_or(DEFAULT_HTTP_BACKOFF_MS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app_code.trim().is_empty() {
            anyhow::bail!("KILN_APP_CODE cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if let BucketConfig::S3(s3) = &self.bucket {
            if s3.bucket.is_empty() {
                anyhow::bail!("S3 bucket name cannot be empty");
            }
            // Both empty selects the ambient AWS credential chain.
            if s3.access_key.is_empty() != s3.secret_key.is_empty() {
                anyhow::bail!("S3_ACCESS_KEY and S3_SECRET_KEY must be set together");
            }
        }

        if self.http.max_attempts == 0 {
            anyhow::bail!("KILN_HTTP_MAX_RETRIES must be at least 1");
        }

        if self.http.timeout_secs == 0 {
            anyhow::bail!("KILN_HTTP_TIMEOUT must be greater than 0");
        }

        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> KilnConfig {
        KilnConfig {
            app_code: "kiln".to_string(),
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: 5,
                min_connections: 1,
                connect_timeout_secs: 10,
            },
            bucket: BucketConfig::Local {
                root: PathBuf::from("/tmp/bucket"),
            },
            http: HttpConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_min_connections_above_max_rejected() {
        let mut config = sample();
        config.database.min_connections = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_without_credentials_rejected() {
        let mut config = sample();
        let mut s3 = S3Config::for_minio("http://localhost:9000", "kiln");
        s3.secret_key.clear();
        config.bucket = BucketConfig::S3(s3);
        assert!(config.validate().is_err());

        if let BucketConfig::S3(s3) = &mut config.bucket {
            s3.access_key.clear();
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = sample();
        config.http.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
