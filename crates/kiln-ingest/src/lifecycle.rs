//! Shared start/finish/fail state machine for tasks and jobs
//!
//! ```text
//! pending -> started -> finished
//!                    \-> failed
//! ```
//!
//! Terminal states are final: a second `fail`, or `finish` after `fail`, is
//! rejected and leaves the recorded state untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::ResourceSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Started,
    Finished,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot {action}: not started (status {status})")]
    NotStarted { action: &'static str, status: Status },

    #[error("cannot {action}: already {status}")]
    AlreadyTerminal { action: &'static str, status: Status },

    #[error("already started")]
    AlreadyStarted,
}

/// Timing, resource samples and outcome of one task or job
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    status: Status,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    start_sample: Option<ResourceSample>,
    end_sample: Option<ResourceSample>,
    exception: Option<String>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            status: Status::Pending,
            started_at: None,
            ended_at: None,
            start_sample: None,
            end_sample: None,
            exception: None,
        }
    }
}

impl Lifecycle {
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn start_sample(&self) -> Option<ResourceSample> {
        self.start_sample
    }

    pub fn end_sample(&self) -> Option<ResourceSample> {
        self.end_sample
    }

    /// Seconds between start and end; `None` until ended.
    pub fn duration(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.ended_at?);
        Some((end - start).num_microseconds().unwrap_or(0).max(0) as f64 / 1_000_000.0)
    }

    /// Clamped growth between the two samples; `None` until ended.
    pub fn usage(&self) -> Option<ResourceSample> {
        Some(self.start_sample?.delta_to(&self.end_sample?))
    }

    pub fn check_start(&self) -> Result<(), LifecycleError> {
        match self.status {
            Status::Pending => Ok(()),
            Status::Started => Err(LifecycleError::AlreadyStarted),
            status => Err(LifecycleError::AlreadyTerminal {
                action: "start",
                status,
            }),
        }
    }

    pub fn check_end(&self, action: &'static str) -> Result<(), LifecycleError> {
        match self.status {
            Status::Started => Ok(()),
            Status::Pending => Err(LifecycleError::NotStarted {
                action,
                status: Status::Pending,
            }),
            status => Err(LifecycleError::AlreadyTerminal { action, status }),
        }
    }

    pub fn start(&mut self, at: DateTime<Utc>, sample: ResourceSample) -> Result<(), LifecycleError> {
        self.check_start()?;
        self.status = Status::Started;
        self.started_at = Some(at);
        self.start_sample = Some(sample);
        Ok(())
    }

    pub fn finish(&mut self, at: DateTime<Utc>, sample: ResourceSample) -> Result<(), LifecycleError> {
        self.check_end("finish")?;
        self.end(at, sample);
        self.status = Status::Finished;
        Ok(())
    }

    pub fn fail(
        &mut self,
        at: DateTime<Utc>,
        sample: ResourceSample,
        error: &str,
    ) -> Result<(), LifecycleError> {
        self.check_end("fail")?;
        self.end(at, sample);
        self.status = Status::Failed;
        let error = error.trim();
        self.exception = Some(if error.is_empty() {
            "unknown error".to_string()
        } else {
            error.to_string()
        });
        Ok(())
    }

    fn end(&mut self, at: DateTime<Utc>, sample: ResourceSample) {
        // ended_at never precedes started_at, even with a skewed clock
        self.ended_at = Some(self.started_at.map_or(at, |s| at.max(s)));
        self.end_sample = Some(sample);
    }
}
