// src/config.rs
//
// Environment-driven configuration, generalizing the teacher's scattered
// `std::env::var` reads (see the old `resources.rs` Slurm/PBS detection)
// into one constructor. Every toggle spec.md §6 names honours a default so
// the binary runs out of the box.

use std::time::Duration;

fn env_secs(key: &str, default_secs: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Coordinator-side tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub scheduling_interval: Duration,
    pub health_interval: Duration,
    pub cleanup_interval: Duration,
    pub worker_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub max_retries: u32,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            scheduling_interval: env_secs("SCHEDULING_INTERVAL", 2),
            health_interval: env_secs("HEALTH_INTERVAL", 5),
            cleanup_interval: env_secs("CLEANUP_INTERVAL", 10),
            worker_timeout: env_secs("WORKER_TIMEOUT", 120),
            heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT", 120),
            max_retries: env_u32("MAX_RETRIES", 3),
        }
    }
}

/// Worker-side tunables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub min_disk_mb: u64,
    pub max_cpu_percent: u32,
    pub max_memory_mb: u64,
    pub persist_inputs: bool,
    pub persist_outputs: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL", 30),
            poll_interval: env_secs("POLL_INTERVAL", 10),
            max_concurrent_jobs: env_usize("MAX_CONCURRENT_JOBS", 1),
            min_disk_mb: env_usize("MIN_DISK_MB", 1024) as u64,
            max_cpu_percent: env_u32("MAX_CPU_PERCENT", 100),
            max_memory_mb: env_usize("MAX_MEMORY_MB", 4096) as u64,
            persist_inputs: env_bool("PERSIST_INPUTS"),
            persist_outputs: env_bool("PERSIST_OUTPUTS"),
        }
    }
}
