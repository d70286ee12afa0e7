//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds a job may stay `Waiting` before it is failed.
    #[serde(default = "default_waiting_timeout")]
    pub waiting_timeout_secs: u64,
    /// Seconds a job may stay `Scheduling` before it is requeued.
    #[serde(default = "default_scheduling_timeout")]
    pub scheduling_timeout_secs: u64,
    /// Period of the monitor sweeps and of the resume ticker.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Lease of the run-level craft and trigger locks.
    #[serde(default = "default_run_lock_lease")]
    pub run_lock_lease_secs: u64,
    /// Lease of the per-job monitor locks.
    #[serde(default = "default_job_lock_lease")]
    pub job_lock_lease_secs: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    /// Capacity of the in-process evaluation channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_queue_poll")]
    pub queue_poll_secs: u64,
    /// Region used by jobs that do not name one.
    #[serde(default = "default_region")]
    pub default_region: String,
    #[serde(default = "default_max_template_depth")]
    pub max_template_depth: usize,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_waiting_timeout() -> u64 {
    3600
}

fn default_scheduling_timeout() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_run_lock_lease() -> u64 {
    300
}

fn default_job_lock_lease() -> u64 {
    60
}

fn default_lock_retries() -> u32 {
    1
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_queue_poll() -> u64 {
    5
}

fn default_region() -> String {
    "default".to_string()
}

fn default_max_template_depth() -> usize {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            waiting_timeout_secs: default_waiting_timeout(),
            scheduling_timeout_secs: default_scheduling_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            run_lock_lease_secs: default_run_lock_lease(),
            job_lock_lease_secs: default_job_lock_lease(),
            lock_retries: default_lock_retries(),
            channel_capacity: default_channel_capacity(),
            queue_poll_secs: default_queue_poll(),
            default_region: default_region(),
            max_template_depth: default_max_template_depth(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn run_lock_lease(&self) -> Duration {
        Duration::from_secs(self.run_lock_lease_secs)
    }

    pub fn job_lock_lease(&self) -> Duration {
        Duration::from_secs(self.job_lock_lease_secs)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_secs(self.queue_poll_secs)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.waiting_timeout_secs, 3600);
        assert_eq!(config.scheduling_timeout_secs, 600);
        assert_eq!(config.run_lock_lease(), Duration::from_secs(300));
        assert_eq!(config.job_lock_lease(), Duration::from_secs(60));
        assert_eq!(config.default_region, "default");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: EngineConfig = serde_yaml::from_str(
            "waiting_timeout_secs: 120\ndefault_region: eu-west\nlog:\n  json: true\n",
        )
        .unwrap();
        assert_eq!(config.waiting_timeout_secs, 120);
        assert_eq!(config.scheduling_timeout_secs, 600);
        assert_eq!(config.default_region, "eu-west");
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
    }
}
