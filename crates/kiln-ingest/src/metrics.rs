//! CPU and memory sampling for task and job statistics
//!
//! A [`ResourceSampler`] is read exactly twice per lifecycle: once on start and
//! once on finish or fail. [`SystemSampler`] reads the live host through
//! `sysinfo`; [`ScriptedSampler`] replays fixed values so tests stay
//! deterministic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use sysinfo::{Pid, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::sync::Mutex;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One point-in-time reading
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Host-wide CPU utilisation, 0..=100
    pub cpu_percent: f64,
    /// Resident memory of this process in MB
    pub memory_mb: f64,
}

impl ResourceSample {
    pub fn new(cpu_percent: f64, memory_mb: f64) -> Self {
        Self {
            cpu_percent,
            memory_mb,
        }
    }

    /// Growth from `self` to `end`, clamped at zero on both axes.
    pub fn delta_to(&self, end: &ResourceSample) -> ResourceSample {
        ResourceSample {
            cpu_percent: (end.cpu_percent - self.cpu_percent).max(0.0),
            memory_mb: (end.memory_mb - self.memory_mb).max(0.0),
        }
    }
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> ResourceSample;
}

/// Reads the host CPU meter and this process's resident set size.
pub struct SystemSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for SystemSampler {
    async fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock().await;

        // The first refresh only seeds the counters; usage is computed against it.
        system.refresh_cpu_usage();
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();
        let cpu_percent = f64::from(system.global_cpu_usage());

        let memory_mb = match self.pid {
            Some(pid) => {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                system
                    .process(pid)
                    .map(|p| p.memory() as f64 / BYTES_PER_MB)
                    .unwrap_or(0.0)
            },
            None => 0.0,
        };

        ResourceSample {
            cpu_percent,
            memory_mb,
        }
    }
}

/// Replays queued samples in order, then repeats the last one.
pub struct ScriptedSampler {
    queue: Mutex<VecDeque<ResourceSample>>,
    last: Mutex<ResourceSample>,
}

impl ScriptedSampler {
    pub fn new(samples: impl IntoIterator<Item = ResourceSample>) -> Self {
        Self {
            queue: Mutex::new(samples.into_iter().collect()),
            last: Mutex::new(ResourceSample::default()),
        }
    }

    /// Sampler that always reports the same reading.
    pub fn constant(sample: ResourceSample) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            last: Mutex::new(sample),
        }
    }
}

#[async_trait]
impl ResourceSampler for ScriptedSampler {
    async fn sample(&self) -> ResourceSample {
        let mut last = self.last.lock().await;
        if let Some(next) = self.queue.lock().await.pop_front() {
            *last = next;
        }
        *last
    }
}

/// Identity of the machine and process running a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_name: String,
    pub execution_user: String,
    pub process_id: u32,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            host_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            execution_user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            process_id: std::process::id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_never_negative() {
        let start = ResourceSample::new(80.0, 512.0);
        let end = ResourceSample::new(20.0, 600.0);
        let delta = start.delta_to(&end);
        assert_eq!(delta.cpu_percent, 0.0);
        assert_eq!(delta.memory_mb, 88.0);
    }

    #[tokio::test]
    async fn test_scripted_sampler_repeats_last() {
        let sampler = ScriptedSampler::new([
            ResourceSample::new(1.0, 10.0),
            ResourceSample::new(2.0, 20.0),
        ]);
        assert_eq!(sampler.sample().await.cpu_percent, 1.0);
        assert_eq!(sampler.sample().await.cpu_percent, 2.0);
        assert_eq!(sampler.sample().await.cpu_percent, 2.0);
    }

    #[tokio::test]
    async fn test_system_sampler_reads_process_memory() {
        let sample = SystemSampler::new().sample().await;
        assert!(sample.cpu_percent >= 0.0);
        assert!(sample.memory_mb > 0.0);
    }

    #[test]
    fn test_host_info_detect() {
        let host = HostInfo::detect();
        assert_eq!(host.process_id, std::process::id());
        assert!(!host.host_name.is_empty());
    }
}
