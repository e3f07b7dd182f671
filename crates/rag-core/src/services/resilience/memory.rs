use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::utils::error::ClassifiedError;

/// One reading of process memory against host memory.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySample {
    pub process_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.process_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    pub fn process_mb(&self) -> u64 {
        self.process_bytes / 1024 / 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Ok,
    Warning,
    Critical,
}

/// Source of memory readings; swapped out in tests.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Reads resident memory of the current process through `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> MemorySample {
        let mut sys = self.system.lock();
        sys.refresh_memory();

        let process_bytes = match self.pid {
            Some(pid) => {
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                sys.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        MemorySample {
            process_bytes,
            total_bytes: sys.total_memory(),
        }
    }
}

/// Fails calls fast when the process is above the critical memory threshold.
///
/// Thresholds are percentages of host memory held by this process.
pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    warning_percent: f64,
    critical_percent: f64,
}

impl MemoryGuard {
    pub fn new(probe: Arc<dyn MemoryProbe>, warning_percent: f64, critical_percent: f64) -> Self {
        Self {
            probe,
            warning_percent,
            critical_percent,
        }
    }

    pub fn sample(&self) -> MemorySample {
        self.probe.sample()
    }

    pub fn status(&self, sample: &MemorySample) -> MemoryStatus {
        let usage = sample.usage_percent();
        if usage >= self.critical_percent {
            MemoryStatus::Critical
        } else if usage >= self.warning_percent {
            MemoryStatus::Warning
        } else {
            MemoryStatus::Ok
        }
    }

    pub fn check(&self, operation: &str) -> Result<MemorySample, ClassifiedError> {
        let sample = self.probe.sample();
        let usage = sample.usage_percent();

        if usage >= self.critical_percent {
            warn!(
                "Memory usage at {:.2}% ({} MB) is above critical {:.0}%, rejecting {}",
                usage,
                sample.process_mb(),
                self.critical_percent,
                operation
            );
            return Err(ClassifiedError::resource_exhausted(format!(
                "memory usage {:.2}% exceeds critical threshold {:.0}%",
                usage, self.critical_percent
            ))
            .with_retry_after(std::time::Duration::from_secs(60)));
        }

        if usage >= self.warning_percent {
            warn!(
                "Memory usage at {:.2}% ({} MB) is above warning {:.0}%",
                usage,
                sample.process_mb(),
                self.warning_percent
            );
        } else {
            debug!("Memory usage: {:.2}% before {}", usage, operation);
        }

        Ok(sample)
    }
}
